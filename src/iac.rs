use std::fmt;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use clap::ValueEnum;
use tracing::{debug, warn};

use crate::config::ArtifactFormat;
use crate::error::{Result, SynthError};

/// External tools able to realize a synthesized artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployTool {
    AwsCli,
    Terraform,
    OpenTofu,
}

impl fmt::Display for DeployTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeployTool::AwsCli => "aws-cloudformation",
            DeployTool::Terraform => "terraform",
            DeployTool::OpenTofu => "tofu",
        })
    }
}

impl DeployTool {
    pub fn binary_name(&self) -> &'static str {
        match self {
            DeployTool::AwsCli => "aws",
            DeployTool::Terraform => "terraform",
            DeployTool::OpenTofu => "tofu",
        }
    }

    fn accepts(&self, format: ArtifactFormat) -> bool {
        match self {
            DeployTool::AwsCli => matches!(
                format,
                ArtifactFormat::Cloudformation | ArtifactFormat::CloudformationYaml
            ),
            DeployTool::Terraform | DeployTool::OpenTofu => format == ArtifactFormat::Terraform,
        }
    }

    /// Pick the tool for a format: an explicit choice must match the format;
    /// Terraform artifacts prefer `tofu` when both binaries are on PATH.
    pub fn resolve(arg: Option<DeployToolArg>, format: ArtifactFormat) -> Result<Self> {
        if let Some(arg) = arg {
            let tool = DeployTool::from(arg);
            if !tool.accepts(format) {
                return Err(SynthError::Config(format!(
                    "deploy tool '{tool}' cannot deploy {} artifacts",
                    format.as_str()
                )));
            }
            return Ok(tool);
        }

        match format {
            ArtifactFormat::Cloudformation | ArtifactFormat::CloudformationYaml => {
                Ok(DeployTool::AwsCli)
            }
            ArtifactFormat::Terraform => {
                if which::which("tofu").is_ok() {
                    return Ok(DeployTool::OpenTofu);
                }
                if which::which("terraform").is_err() {
                    warn!(
                        "No terraform/tofu binary found on PATH; defaulting to terraform. Deployment will fail if the binary is missing."
                    );
                }
                Ok(DeployTool::Terraform)
            }
        }
    }
}

/// CLI argument helper for deploy tool selection.
#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DeployToolArg {
    #[value(alias = "cloudformation")]
    Aws,
    #[value(alias = "tf")]
    Terraform,
    #[value(alias = "tofu")]
    OpenTofu,
}

impl From<DeployToolArg> for DeployTool {
    fn from(value: DeployToolArg) -> Self {
        match value {
            DeployToolArg::Aws => DeployTool::AwsCli,
            DeployToolArg::Terraform => DeployTool::Terraform,
            DeployToolArg::OpenTofu => DeployTool::OpenTofu,
        }
    }
}

/// Runner responsible for executing external commands. Returns stdout.
pub trait CommandRunner: Send + Sync {
    fn run(&self, binary: &'static str, dir: &Path, args: &[&str]) -> Result<String>;
}

pub struct DefaultCommandRunner;

impl CommandRunner for DefaultCommandRunner {
    fn run(&self, binary: &'static str, dir: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(binary)
            .args(args)
            .current_dir(dir)
            .stdin(std::process::Stdio::null())
            .output();
        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let step = args.first().copied().unwrap_or("command").to_string();
                debug!(binary, step = %step, stderr = %stderr);
                Err(SynthError::DeployTool {
                    tool: binary.to_string(),
                    step,
                    status: output.status.code(),
                    stderr,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(SynthError::DeployToolMissing {
                    tool: binary.to_string(),
                    binary,
                })
            }
            Err(err) => Err(SynthError::Io(err)),
        }
    }
}

/// Argument lists for each deploy step, in execution order.
pub fn deploy_commands(
    tool: DeployTool,
    stack_name: &str,
    template_file: &str,
    region: &str,
) -> Vec<Vec<String>> {
    let owned = |args: &[&str]| args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
    match tool {
        DeployTool::AwsCli => vec![owned(&[
            "cloudformation",
            "deploy",
            "--template-file",
            template_file,
            "--stack-name",
            stack_name,
            "--region",
            region,
            "--capabilities",
            "CAPABILITY_NAMED_IAM",
            "--no-fail-on-empty-changeset",
        ])],
        DeployTool::Terraform | DeployTool::OpenTofu => vec![
            owned(&["init", "-input=false"]),
            owned(&["plan", "-input=false", "-out=plan.tfplan"]),
            owned(&["apply", "-input=false", "-auto-approve", "plan.tfplan"]),
        ],
    }
}

/// Run the deploy steps inside `dir`. Provider failures surface unchanged.
pub fn run_deploy(
    runner: &dyn CommandRunner,
    tool: DeployTool,
    dir: &Path,
    stack_name: &str,
    template_file: &str,
    region: &str,
) -> Result<()> {
    for command in deploy_commands(tool, stack_name, template_file, region) {
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        runner.run(tool.binary_name(), dir, &args)?;
    }
    Ok(())
}

/// Exponential backoff for idempotent lookups performed by the driver.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial: Duration::from_millis(500),
        }
    }
}

impl Backoff {
    pub fn retry<T>(&self, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let mut delay = self.initial;
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.attempts || !is_retryable(&err) => return Err(err),
                Err(err) => {
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying after {err}");
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

fn is_retryable(err: &SynthError) -> bool {
    matches!(err, SynthError::DeployTool { .. } | SynthError::Io(_))
}

/// Resolve the region's default VPC id through the AWS CLI.
pub fn lookup_default_vpc(
    runner: &dyn CommandRunner,
    region: &str,
    backoff: Backoff,
) -> Result<String> {
    let args = [
        "ec2",
        "describe-vpcs",
        "--region",
        region,
        "--filters",
        "Name=isDefault,Values=true",
        "--query",
        "Vpcs[0].VpcId",
        "--output",
        "text",
    ];
    let stdout = backoff.retry(|_| runner.run("aws", Path::new("."), &args))?;
    let vpc_id = stdout.trim();
    if vpc_id.is_empty() || vpc_id == "None" {
        return Err(SynthError::Lookup(format!("no default VPC in region {region}")));
    }
    Ok(vpc_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MockRunner {
        calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
        responses: Mutex<Vec<Result<String>>>,
    }

    impl MockRunner {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                responses: Mutex::new(responses),
            }
        }

        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, binary: &'static str, _dir: &Path, args: &[&str]) -> Result<String> {
            self.calls.lock().unwrap().push((
                binary.to_string(),
                args.iter().map(|arg| arg.to_string()).collect(),
            ));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(String::new())
            } else {
                responses.remove(0)
            }
        }
    }

    fn tool_failure() -> SynthError {
        SynthError::DeployTool {
            tool: "aws".into(),
            step: "ec2".into(),
            status: Some(255),
            stderr: "throttled".into(),
        }
    }

    fn quick() -> Backoff {
        Backoff {
            attempts: 3,
            initial: Duration::ZERO,
        }
    }

    #[test]
    fn terraform_sequence_invokes_commands() {
        let runner = MockRunner::new(Vec::new());
        run_deploy(
            &runner,
            DeployTool::OpenTofu,
            Path::new("dummy"),
            "Stack",
            "main.tf",
            "us-east-1",
        )
        .unwrap();
        let steps: Vec<_> = runner
            .calls()
            .into_iter()
            .map(|(binary, args)| format!("{binary} {}", args.join(" ")))
            .collect();
        assert_eq!(
            steps,
            vec![
                "tofu init -input=false",
                "tofu plan -input=false -out=plan.tfplan",
                "tofu apply -input=false -auto-approve plan.tfplan",
            ]
        );
    }

    #[test]
    fn cloudformation_deploy_names_stack_and_capabilities() {
        let runner = MockRunner::new(Vec::new());
        run_deploy(
            &runner,
            DeployTool::AwsCli,
            Path::new("dummy"),
            "OllamaServerStack",
            "template.json",
            "us-east-1",
        )
        .unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "aws");
        let args = calls[0].1.join(" ");
        assert!(args.starts_with("cloudformation deploy --template-file template.json"));
        assert!(args.contains("--stack-name OllamaServerStack"));
        assert!(args.contains("CAPABILITY_NAMED_IAM"));
    }

    #[test]
    fn deploy_failure_is_surfaced_verbatim() {
        let runner = MockRunner::new(vec![Err(tool_failure())]);
        let err = run_deploy(
            &runner,
            DeployTool::AwsCli,
            Path::new("dummy"),
            "Stack",
            "template.json",
            "us-east-1",
        )
        .unwrap_err();
        assert!(err.to_string().contains("throttled"), "{err}");
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn explicit_tool_must_match_format() {
        assert!(DeployTool::resolve(Some(DeployToolArg::Aws), ArtifactFormat::Terraform).is_err());
        assert_eq!(
            DeployTool::resolve(Some(DeployToolArg::OpenTofu), ArtifactFormat::Terraform).unwrap(),
            DeployTool::OpenTofu
        );
        assert_eq!(
            DeployTool::resolve(None, ArtifactFormat::CloudformationYaml).unwrap(),
            DeployTool::AwsCli
        );
    }

    #[test]
    fn lookup_retries_transient_failures() {
        let runner = MockRunner::new(vec![Err(tool_failure()), Ok("vpc-0abc\n".into())]);
        let vpc = lookup_default_vpc(&runner, "us-east-1", quick()).unwrap();
        assert_eq!(vpc, "vpc-0abc");
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn lookup_gives_up_after_attempts() {
        let runner = MockRunner::new(vec![
            Err(tool_failure()),
            Err(tool_failure()),
            Err(tool_failure()),
            Ok("vpc-late".into()),
        ]);
        assert!(lookup_default_vpc(&runner, "us-east-1", quick()).is_err());
        assert_eq!(runner.calls().len(), 3);
    }

    #[test]
    fn missing_binary_is_not_retried() {
        let runner = MockRunner::new(vec![Err(SynthError::DeployToolMissing {
            tool: "aws".into(),
            binary: "aws",
        })]);
        assert!(lookup_default_vpc(&runner, "us-east-1", quick()).is_err());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn lookup_without_default_vpc_fails() {
        let runner = MockRunner::new(vec![Ok("None\n".into())]);
        let err = lookup_default_vpc(&runner, "eu-west-1", quick()).unwrap_err();
        assert!(matches!(err, SynthError::Lookup(_)));
    }
}
