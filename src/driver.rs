use std::io::{self, Write};

use tracing::{info, info_span, warn};

use crate::config::{ArtifactFormat, DriverConfig, PeerScope};
use crate::diff::{ArtifactStore, StackDiff, write_atomic};
use crate::error::{Result, SynthError};
use crate::graph::build_graph;
use crate::iac::{Backoff, CommandRunner, DefaultCommandRunner, lookup_default_vpc, run_deploy};
use crate::stack::ollama_stack;
use crate::synth::synthesize;
use crate::telemetry;

/// What one invocation produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub digest: String,
    pub version: Option<u64>,
    pub diff: Option<StackDiff>,
    pub deployed: bool,
}

pub fn run(config: DriverConfig) -> Result<RunReport> {
    run_with_runner(config, &DefaultCommandRunner)
}

pub fn run_with_runner(mut config: DriverConfig, runner: &dyn CommandRunner) -> Result<RunReport> {
    telemetry::init(&config.log)?;

    if config.lookup_vpc && config.stack.network_id.is_none() {
        let span = stage_span("lookup", &config);
        let _enter = span.enter();
        let vpc_id = lookup_default_vpc(runner, &config.stack.region, Backoff::default())?;
        info!(%vpc_id, "resolved default VPC");
        config.stack = config.stack.with_network_id(vpc_id);
    }
    let stack_config = &config.stack;

    match stack_config.peer_scope {
        PeerScope::DefaultRestricted => warn!(
            "no peer configured; ingress admits only {} until PEER_IP is set",
            stack_config.peer_cidr
        ),
        PeerScope::DefaultOpen => warn!(
            "no peer configured and open ingress allowed; ports are reachable from {}",
            stack_config.peer_cidr
        ),
        PeerScope::Explicit => {}
    }

    let stack = {
        let span = stage_span("model", &config);
        let _enter = span.enter();
        ollama_stack(stack_config)?
    };
    let graph = {
        let span = stage_span("graph", &config);
        let _enter = span.enter();
        build_graph(&stack)?
    };
    info!(order = ?graph.order_ids(), "dependency order");

    let artifact = {
        let span = stage_span("synthesis", &config);
        let _enter = span.enter();
        synthesize(&graph, stack_config, config.format)?
    };

    let mut report = RunReport {
        digest: artifact.manifest.digest.clone(),
        version: None,
        diff: None,
        deployed: false,
    };

    if let Some(output) = &config.output {
        write_atomic(output, artifact.document.as_bytes())?;
        info!("wrote {}", output.display());
        return Ok(report);
    }

    let Some(output_dir) = &config.output_dir else {
        let mut stdout = io::stdout().lock();
        stdout.write_all(artifact.document.as_bytes())?;
        stdout.flush()?;
        return Ok(report);
    };

    let stored = {
        let span = stage_span("diff", &config);
        let _enter = span.enter();
        ArtifactStore::new(output_dir).store(&artifact)?
    };
    println!(
        "{} v{} -> {}",
        artifact.manifest.stack_name,
        stored.version,
        stored.template_path.display()
    );
    println!("{}", stored.diff);
    report.version = Some(stored.version);
    report.diff = Some(stored.diff.clone());

    let Some(tool) = config.deploy else {
        return Ok(report);
    };
    if config.format != ArtifactFormat::Terraform && stack_config.network_id.is_none() {
        warn!("DefaultVpc has no default value; pass --vpc-id or --lookup-vpc if the deploy asks for it");
    }
    if config.yes || confirm_or_cancel(&format!("deploy with {tool}"))? {
        let span = stage_span("deploy", &config);
        let _enter = span.enter();
        run_deploy(
            runner,
            tool,
            &stored.dir,
            &artifact.manifest.stack_name,
            config.format.template_file_name(),
            &stack_config.region,
        )?;
        info!(%tool, "deploy finished");
        report.deployed = true;
    }
    Ok(report)
}

fn confirm_or_cancel(action: &str) -> Result<bool> {
    print!("Confirm {action}? [y/N]: ");
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    let response = buf.trim().to_ascii_lowercase();
    if response == "y" || response == "yes" {
        Ok(true)
    } else {
        println!("Skipping {action}.");
        Ok(false)
    }
}

fn stage_span(stage: &str, config: &DriverConfig) -> tracing::Span {
    info_span!(
        "synthesis",
        stage,
        stack = %config.stack.stack_name,
        format = %config.format.as_str(),
        variant = if config.stack.use_gpu { "gpu" } else { "cpu" }
    )
}

/// Print a failed run to stderr and pick the exit code. Configuration errors
/// carry their own prefix.
pub fn report_error(err: &SynthError) -> i32 {
    if err.is_configuration() {
        eprintln!("{err}");
    } else {
        eprintln!("error: {err}");
    }
    err.exit_code()
}
