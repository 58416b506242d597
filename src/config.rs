use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SynthError};
use crate::iac::{DeployTool, DeployToolArg};
use crate::model::PropertyValue;

pub const DEFAULT_STACK_NAME: &str = "OllamaServerStack";
pub const DEFAULT_KEY_PAIR_NAME: &str = "default-key-pair";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_MODELS: &[&str] = &["deepseek-r1:8b", "qwen2.5-coder:1.5b"];
pub const DEFAULT_VOLUME_SIZE_GIB: i64 = 100;
pub const DEFAULT_WARMUP_SECS: u32 = 15;
/// Scope used when no peer is configured: rules exist but admit nothing remote.
pub const DEFAULT_PEER_CIDR: &str = "127.0.0.1/32";
pub const OPEN_PEER_CIDR: &str = "0.0.0.0/0";
const DEFAULT_ENV_FILE: &str = ".env";

/// Artifact flavour emitted by the synthesizer.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactFormat {
    #[default]
    #[value(alias = "cfn")]
    Cloudformation,
    #[value(alias = "cfn-yaml")]
    CloudformationYaml,
    #[value(alias = "tf", alias = "hcl")]
    Terraform,
}

impl ArtifactFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactFormat::Cloudformation => "cloudformation",
            ArtifactFormat::CloudformationYaml => "cloudformation-yaml",
            ArtifactFormat::Terraform => "terraform",
        }
    }

    pub fn template_file_name(&self) -> &'static str {
        match self {
            ArtifactFormat::Cloudformation => "template.json",
            ArtifactFormat::CloudformationYaml => "template.yaml",
            ArtifactFormat::Terraform => "main.tf",
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Top-level CLI structure. Synthesis is the only command.
#[derive(Debug, Parser)]
#[command(
    name = "stack-synth",
    version,
    about = "Synthesize a model-serving VM stack into CloudFormation or Terraform.",
    long_about = "Values resolve as flags > environment variables > env file (--env-file or ./.env) > defaults. Without --output/--output-dir the template is written to stdout."
)]
pub struct CliArgs {
    /// Select the GPU instance, image and boot branch.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub use_gpu: Option<bool>,

    /// Machine image for CPU mode (CPU_AMI_ID).
    #[arg(long)]
    pub cpu_ami_id: Option<String>,

    /// Machine image for GPU mode (GPU_AMI_ID).
    #[arg(long)]
    pub gpu_ami_id: Option<String>,

    /// Instance type for CPU mode (CPU_INSTANCE_TYPE).
    #[arg(long)]
    pub cpu_instance_type: Option<String>,

    /// Instance type for GPU mode (GPU_INSTANCE_TYPE).
    #[arg(long)]
    pub gpu_instance_type: Option<String>,

    /// EC2 key pair attached to the instance (KEY_PAIR_NAME).
    #[arg(long)]
    pub key_pair_name: Option<String>,

    /// Address or CIDR allowed through the ingress rules (PEER_IP).
    #[arg(long)]
    pub peer_ip: Option<String>,

    /// Open ingress to 0.0.0.0/0 when no peer is configured (ALLOW_OPEN_INGRESS).
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub allow_open_ingress: Option<bool>,

    /// Bucket the instance role may read (S3_BUCKET_NAME).
    #[arg(long)]
    pub s3_bucket_name: Option<String>,

    /// Bucket ARN for the access policy (S3_BUCKET_ARN).
    #[arg(long)]
    pub s3_bucket_arn: Option<String>,

    /// Object ARN pattern for the access policy (S3_BUCKET_ARN_WILDCARD).
    #[arg(long)]
    pub s3_bucket_arn_wildcard: Option<String>,

    /// Existing VPC id (VPC_ID).
    #[arg(long)]
    pub vpc_id: Option<String>,

    /// Look up the default VPC through the AWS CLI when no VPC id is set.
    #[arg(long, default_value_t = false)]
    pub lookup_vpc: bool,

    /// Target region (AWS_REGION / CDK_DEFAULT_REGION).
    #[arg(long)]
    pub region: Option<String>,

    /// Stack name (STACK_NAME).
    #[arg(long)]
    pub stack_name: Option<String>,

    /// Comma-separated models started after the server (OLLAMA_MODELS).
    #[arg(long)]
    pub models: Option<String>,

    /// Root volume size in GiB (VOLUME_SIZE_GIB).
    #[arg(long)]
    pub volume_size: Option<i64>,

    /// Key-value file merged under the process environment.
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Artifact format.
    #[arg(long, value_enum, default_value = "cloudformation")]
    pub format: ArtifactFormat,

    /// Write the template to this file instead of stdout.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Versioned artifact directory; enables diffing against the previous run.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Hand the written artifact to the deploy tool.
    #[arg(long, default_value_t = false)]
    pub deploy: bool,

    /// Deploy tool (aws, terraform/tf, tofu/opentofu). Defaults from --format.
    #[arg(long, value_enum)]
    pub deploy_tool: Option<DeployToolArg>,

    /// Skip the deploy confirmation prompt.
    #[arg(long, default_value_t = false)]
    pub yes: bool,

    /// Log filter (falls back to RUST_LOG, then "warn").
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log line format on stderr.
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

/// Flat key-value configuration snapshot. The process environment shadows the
/// env file; blank values count as unset.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    env: BTreeMap<String, String>,
    file: BTreeMap<String, String>,
}

impl ConfigSource {
    pub fn from_env<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self {
            env: vars.into_iter().collect(),
            file: BTreeMap::new(),
        }
    }

    pub fn with_file_entries(mut self, entries: BTreeMap<String, String>) -> Self {
        self.file = entries;
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        non_blank(&self.env, key).or_else(|| non_blank(&self.file, key))
    }

    fn string(&self, flag: Option<String>, key: &str) -> Option<String> {
        flag.filter(|value| !value.trim().is_empty())
            .or_else(|| self.get(key).map(str::to_string))
    }

    fn boolean(&self, flag: Option<bool>, key: &str) -> Result<bool> {
        if let Some(value) = flag {
            return Ok(value);
        }
        match self.get(key) {
            Some(raw) => parse_bool(key, raw),
            None => Ok(false),
        }
    }
}

fn non_blank<'a>(map: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    map.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

pub fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(SynthError::Config(format!(
            "{key} must be a boolean (true/false), got '{other}'"
        ))),
    }
}

/// Load a flat key-value file: `.toml` files as a flat table, anything else as
/// a dotenv file.
pub fn load_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    if path.extension().is_some_and(|ext| ext == "toml") {
        parse_toml_entries(&fs::read_to_string(path)?)
    } else {
        parse_dotenv(path)
    }
}

fn parse_toml_entries(data: &str) -> Result<BTreeMap<String, String>> {
    let table: toml::Table = data
        .parse()
        .map_err(|err: toml::de::Error| SynthError::Toml(err.to_string()))?;
    let mut entries = BTreeMap::new();
    for (key, value) in table {
        let rendered = match value {
            toml::Value::String(text) => text,
            toml::Value::Integer(number) => number.to_string(),
            toml::Value::Boolean(flag) => flag.to_string(),
            toml::Value::Float(number) => number.to_string(),
            other => {
                return Err(SynthError::Config(format!(
                    "{key} must be a scalar, found {}",
                    other.type_str()
                )));
            }
        };
        entries.insert(key, rendered);
    }
    Ok(entries)
}

fn parse_dotenv(path: &Path) -> Result<BTreeMap<String, String>> {
    let env_error =
        |err: dotenvy::Error| SynthError::Config(format!("env file {}: {err}", path.display()));
    dotenvy::from_path_iter(path)
        .map_err(env_error)?
        .map(|entry| entry.map_err(env_error))
        .collect()
}

/// How the ingress source range was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerScope {
    Explicit,
    DefaultRestricted,
    DefaultOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketAccess {
    pub name: Option<String>,
    pub arn: String,
    pub arn_wildcard: String,
}

/// Resolved external parameters for one synthesis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackConfiguration {
    pub stack_name: String,
    pub use_gpu: bool,
    pub instance_type: String,
    pub machine_image: String,
    pub key_pair_name: String,
    pub peer_cidr: IpNet,
    pub peer_scope: PeerScope,
    pub bucket: Option<BucketAccess>,
    pub network_id: Option<String>,
    pub region: String,
    pub account: Option<String>,
    pub models: Vec<String>,
    pub volume_size_gib: i64,
    pub warmup_secs: u32,
}

impl StackConfiguration {
    pub fn resolve(cli: &CliArgs, source: &ConfigSource) -> Result<Self> {
        let use_gpu = source.boolean(cli.use_gpu, "USE_GPU")?;
        let (image_flag, image_key, type_flag, type_key) = if use_gpu {
            (&cli.gpu_ami_id, "GPU_AMI_ID", &cli.gpu_instance_type, "GPU_INSTANCE_TYPE")
        } else {
            (&cli.cpu_ami_id, "CPU_AMI_ID", &cli.cpu_instance_type, "CPU_INSTANCE_TYPE")
        };
        let mode = if use_gpu { "GPU" } else { "CPU" };

        let instance_type = source.string(type_flag.clone(), type_key).ok_or_else(|| {
            SynthError::Config(format!("{type_key} is required in {mode} mode"))
        })?;
        let machine_image = source.string(image_flag.clone(), image_key).ok_or_else(|| {
            SynthError::Config(format!("{image_key} is required in {mode} mode"))
        })?;

        let stack_name = source
            .string(cli.stack_name.clone(), "STACK_NAME")
            .unwrap_or_else(|| DEFAULT_STACK_NAME.to_string());
        validate_stack_name(&stack_name)?;

        let allow_open = source.boolean(cli.allow_open_ingress, "ALLOW_OPEN_INGRESS")?;
        let (peer_cidr, peer_scope) = resolve_peer(
            source.string(cli.peer_ip.clone(), "PEER_IP").as_deref(),
            allow_open,
        )?;

        let bucket = resolve_bucket(
            source.string(cli.s3_bucket_name.clone(), "S3_BUCKET_NAME"),
            source.string(cli.s3_bucket_arn.clone(), "S3_BUCKET_ARN"),
            source.string(cli.s3_bucket_arn_wildcard.clone(), "S3_BUCKET_ARN_WILDCARD"),
        )?;

        let models = parse_models(source.string(cli.models.clone(), "OLLAMA_MODELS").as_deref())?;

        let volume_size_gib = match cli.volume_size {
            Some(size) => size,
            None => match source.get("VOLUME_SIZE_GIB") {
                Some(raw) => raw.parse().map_err(|_| {
                    SynthError::Config(format!("VOLUME_SIZE_GIB must be an integer, got '{raw}'"))
                })?,
                None => DEFAULT_VOLUME_SIZE_GIB,
            },
        };
        if !(1..=16384).contains(&volume_size_gib) {
            return Err(SynthError::Config(format!(
                "volume size must be between 1 and 16384 GiB, got {volume_size_gib}"
            )));
        }

        let warmup_secs = match source.get("MODEL_SERVER_WARMUP_SECS") {
            Some(raw) => raw.parse().map_err(|_| {
                SynthError::Config(format!(
                    "MODEL_SERVER_WARMUP_SECS must be a non-negative integer, got '{raw}'"
                ))
            })?,
            None => DEFAULT_WARMUP_SECS,
        };

        Ok(Self {
            stack_name,
            use_gpu,
            instance_type,
            machine_image,
            key_pair_name: source
                .string(cli.key_pair_name.clone(), "KEY_PAIR_NAME")
                .unwrap_or_else(|| DEFAULT_KEY_PAIR_NAME.to_string()),
            peer_cidr,
            peer_scope,
            bucket,
            network_id: source.string(cli.vpc_id.clone(), "VPC_ID"),
            region: source
                .string(cli.region.clone(), "AWS_REGION")
                .or_else(|| source.get("CDK_DEFAULT_REGION").map(str::to_string))
                .unwrap_or_else(|| DEFAULT_REGION.to_string()),
            account: source.get("CDK_DEFAULT_ACCOUNT").map(str::to_string),
            models,
            volume_size_gib,
            warmup_secs,
        })
    }

    /// Fill in a network id discovered by the driver before synthesis starts.
    pub fn with_network_id(self, network_id: impl Into<String>) -> Self {
        Self {
            network_id: Some(network_id.into()),
            ..self
        }
    }

    /// Named values available to `PropertyValue::Parameter` placeholders.
    pub fn parameter(&self, name: &str) -> Option<PropertyValue> {
        let value = match name {
            "stack_name" => self.stack_name.clone().into(),
            "instance_type" => self.instance_type.clone().into(),
            "machine_image" => self.machine_image.clone().into(),
            "key_pair_name" => self.key_pair_name.clone().into(),
            "peer_cidr" => self.peer_cidr.to_string().into(),
            "region" => self.region.clone().into(),
            "use_gpu" => self.use_gpu.into(),
            "volume_size_gib" => self.volume_size_gib.into(),
            "network_id" => self.network_id.clone()?.into(),
            "bucket_arn" => self.bucket.as_ref()?.arn.clone().into(),
            "bucket_arn_wildcard" => self.bucket.as_ref()?.arn_wildcard.clone().into(),
            _ => return None,
        };
        Some(value)
    }
}

fn validate_stack_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
        && name.len() <= 128;
    if valid {
        Ok(())
    } else {
        Err(SynthError::Config(format!(
            "stack name '{name}' must start with a letter and contain only letters, digits and hyphens"
        )))
    }
}

fn resolve_peer(raw: Option<&str>, allow_open: bool) -> Result<(IpNet, PeerScope)> {
    let Some(raw) = raw else {
        if allow_open {
            warn!("PEER_IP unset and open ingress allowed; rules admit {OPEN_PEER_CIDR}");
            return Ok((open_net()?, PeerScope::DefaultOpen));
        }
        warn!("PEER_IP unset; ingress rules scoped to {DEFAULT_PEER_CIDR} (no remote access)");
        let net = DEFAULT_PEER_CIDR
            .parse()
            .map_err(|_| SynthError::Other("invalid default peer CIDR".into()))?;
        return Ok((net, PeerScope::DefaultRestricted));
    };

    let net = parse_peer(raw)?;
    if net.prefix_len() == 0 {
        warn!("PEER_IP {net} opens the service, SSH and web UI ports to every address");
    }
    Ok((net, PeerScope::Explicit))
}

fn open_net() -> Result<IpNet> {
    zero_prefix(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Accepts CIDR notation or a bare address. A bare unspecified address
/// (`0.0.0.0`) means "anywhere"; any other bare address is a single host.
pub fn parse_peer(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    match raw.parse::<IpAddr>() {
        Ok(addr) if addr.is_unspecified() => zero_prefix(addr),
        Ok(addr) => Ok(IpNet::from(addr)),
        Err(_) => Err(SynthError::Config(format!(
            "PEER_IP must be an IP address or CIDR, got '{raw}'"
        ))),
    }
}

fn zero_prefix(addr: IpAddr) -> Result<IpNet> {
    IpNet::new(addr, 0).map_err(|err| SynthError::Other(err.to_string()))
}

fn resolve_bucket(
    name: Option<String>,
    arn: Option<String>,
    arn_wildcard: Option<String>,
) -> Result<Option<BucketAccess>> {
    let arn = match (arn, name.as_deref()) {
        (Some(arn), _) => arn,
        (None, Some(name)) => format!("arn:aws:s3:::{name}"),
        (None, None) => {
            if arn_wildcard.is_some() {
                return Err(SynthError::Config(
                    "S3_BUCKET_ARN_WILDCARD requires S3_BUCKET_ARN or S3_BUCKET_NAME".into(),
                ));
            }
            return Ok(None);
        }
    };
    let arn_wildcard = arn_wildcard.unwrap_or_else(|| {
        warn!("S3_BUCKET_ARN_WILDCARD unset; granting object access on {arn}/*");
        format!("{arn}/*")
    });

    for value in [&arn, &arn_wildcard] {
        if !value.starts_with("arn:") {
            return Err(SynthError::Config(format!(
                "bucket ARN '{value}' must start with 'arn:'"
            )));
        }
    }

    Ok(Some(BucketAccess {
        name,
        arn,
        arn_wildcard,
    }))
}

fn parse_models(raw: Option<&str>) -> Result<Vec<String>> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_MODELS.iter().map(|m| m.to_string()).collect());
    };
    let models: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();
    if models.is_empty() {
        return Err(SynthError::Config("OLLAMA_MODELS lists no models".into()));
    }
    if let Some(bad) = models
        .iter()
        .find(|m| !m.chars().all(|c| c.is_ascii_alphanumeric() || "-_.:/".contains(c)))
    {
        return Err(SynthError::Config(format!(
            "model name '{bad}' contains unsupported characters"
        )));
    }
    Ok(models)
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub filter: String,
    pub format: LogFormat,
}

impl LogSettings {
    /// `--log-level` wins over `RUST_LOG`; the default only shows warnings.
    pub fn resolve(cli: &CliArgs, source: &ConfigSource) -> Self {
        let filter = cli
            .log_level
            .clone()
            .or_else(|| source.get("RUST_LOG").map(str::to_string))
            .unwrap_or_else(|| "warn".to_string());
        Self {
            filter,
            format: cli.log_format,
        }
    }
}

/// Everything the driver needs for one invocation.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub stack: StackConfiguration,
    pub format: ArtifactFormat,
    pub output: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub deploy: Option<DeployTool>,
    pub yes: bool,
    pub lookup_vpc: bool,
    pub log: LogSettings,
}

impl DriverConfig {
    /// Resolve the CLI against a snapshot of the process environment. The env
    /// file (explicit or `./.env`) is merged underneath the environment.
    pub fn from_env_and_args(cli: CliArgs, env: ConfigSource) -> Result<Self> {
        let source = Self::load_source(&cli, env)?;
        Self::from_source(cli, &source)
    }

    /// Merge the env file selected by the CLI under the environment snapshot.
    pub fn load_source(cli: &CliArgs, env: ConfigSource) -> Result<ConfigSource> {
        Ok(match env_file_path(cli.env_file.as_deref())? {
            Some(path) => env.with_file_entries(load_env_file(&path)?),
            None => env,
        })
    }

    pub fn from_source(cli: CliArgs, source: &ConfigSource) -> Result<Self> {
        let stack = StackConfiguration::resolve(&cli, source)?;

        let deploy = if cli.deploy {
            if cli.output_dir.is_none() {
                return Err(SynthError::Config("--deploy requires --output-dir".into()));
            }
            Some(DeployTool::resolve(cli.deploy_tool, cli.format)?)
        } else {
            None
        };
        if cli.output.is_some() && cli.output_dir.is_some() {
            return Err(SynthError::Config(
                "--output and --output-dir are mutually exclusive".into(),
            ));
        }

        let log = LogSettings::resolve(&cli, source);

        Ok(Self {
            stack,
            format: cli.format,
            output: cli.output,
            output_dir: cli.output_dir,
            deploy,
            yes: cli.yes,
            lookup_vpc: cli.lookup_vpc,
            log,
        })
    }
}

fn env_file_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) if !path.is_file() => Err(SynthError::Config(format!(
            "env file {} does not exist",
            path.display()
        ))),
        Some(path) => Ok(Some(path.to_path_buf())),
        None => {
            let default = PathBuf::from(DEFAULT_ENV_FILE);
            Ok(default.is_file().then_some(default))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> ConfigSource {
        ConfigSource::from_env(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    fn cli(args: &[&str]) -> CliArgs {
        let mut full = vec!["stack-synth"];
        full.extend_from_slice(args);
        CliArgs::parse_from(full)
    }

    fn cpu_source() -> ConfigSource {
        source(&[("CPU_AMI_ID", "ami-123"), ("CPU_INSTANCE_TYPE", "m5.2xlarge")])
    }

    #[test]
    fn cpu_mode_resolves_cpu_keys() {
        let config = StackConfiguration::resolve(&cli(&[]), &cpu_source()).unwrap();
        assert!(!config.use_gpu);
        assert_eq!(config.instance_type, "m5.2xlarge");
        assert_eq!(config.machine_image, "ami-123");
        assert_eq!(config.key_pair_name, DEFAULT_KEY_PAIR_NAME);
        assert_eq!(config.stack_name, DEFAULT_STACK_NAME);
        assert_eq!(config.models, vec!["deepseek-r1:8b", "qwen2.5-coder:1.5b"]);
        assert_eq!(config.volume_size_gib, 100);
    }

    #[test]
    fn gpu_mode_ignores_cpu_keys() {
        let env = source(&[
            ("USE_GPU", "true"),
            ("CPU_AMI_ID", "ami-cpu"),
            ("CPU_INSTANCE_TYPE", "m5.2xlarge"),
        ]);
        let err = StackConfiguration::resolve(&cli(&[]), &env).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("GPU_INSTANCE_TYPE"), "{err}");
    }

    #[test]
    fn missing_image_is_a_configuration_error() {
        let env = source(&[("CPU_INSTANCE_TYPE", "m5.2xlarge")]);
        let err = StackConfiguration::resolve(&cli(&[]), &env).unwrap_err();
        assert!(err.to_string().contains("CPU_AMI_ID"), "{err}");
    }

    #[test]
    fn flags_override_environment() {
        let config = StackConfiguration::resolve(
            &cli(&["--cpu-instance-type", "c6i.large", "--key-pair-name", "ops"]),
            &cpu_source(),
        )
        .unwrap();
        assert_eq!(config.instance_type, "c6i.large");
        assert_eq!(config.key_pair_name, "ops");
    }

    #[test]
    fn explicit_false_flag_overrides_gpu_env() {
        let env = source(&[
            ("USE_GPU", "true"),
            ("CPU_AMI_ID", "ami-123"),
            ("CPU_INSTANCE_TYPE", "m5.2xlarge"),
        ]);
        let config = StackConfiguration::resolve(&cli(&["--use-gpu", "false"]), &env).unwrap();
        assert!(!config.use_gpu);
    }

    #[test]
    fn environment_shadows_file_entries() {
        let mut file = BTreeMap::new();
        file.insert("CPU_INSTANCE_TYPE".to_string(), "t3.large".to_string());
        file.insert("KEY_PAIR_NAME".to_string(), "from-file".to_string());
        let env = cpu_source().with_file_entries(file);
        let config = StackConfiguration::resolve(&cli(&[]), &env).unwrap();
        assert_eq!(config.instance_type, "m5.2xlarge");
        assert_eq!(config.key_pair_name, "from-file");
    }

    #[test]
    fn blank_values_count_as_unset() {
        let env = source(&[("CPU_AMI_ID", "  "), ("CPU_INSTANCE_TYPE", "m5.2xlarge")]);
        assert!(StackConfiguration::resolve(&cli(&[]), &env).is_err());
    }

    #[test]
    fn invalid_boolean_is_rejected() {
        let env = source(&[("USE_GPU", "maybe")]);
        let err = StackConfiguration::resolve(&cli(&[]), &env).unwrap_err();
        assert!(err.to_string().contains("USE_GPU"), "{err}");
    }

    #[test]
    fn unset_peer_defaults_to_restricted_scope() {
        let config = StackConfiguration::resolve(&cli(&[]), &cpu_source()).unwrap();
        assert_eq!(config.peer_cidr.to_string(), DEFAULT_PEER_CIDR);
        assert_eq!(config.peer_scope, PeerScope::DefaultRestricted);
    }

    #[test]
    fn open_ingress_must_be_requested() {
        let config =
            StackConfiguration::resolve(&cli(&["--allow-open-ingress"]), &cpu_source()).unwrap();
        assert_eq!(config.peer_cidr.to_string(), OPEN_PEER_CIDR);
        assert_eq!(config.peer_scope, PeerScope::DefaultOpen);
    }

    #[test]
    fn peer_addresses_normalize_to_cidrs() {
        assert_eq!(parse_peer("106.72.144.33").unwrap().to_string(), "106.72.144.33/32");
        assert_eq!(parse_peer("10.1.2.3/8").unwrap().to_string(), "10.0.0.0/8");
        assert_eq!(parse_peer("0.0.0.0").unwrap().to_string(), "0.0.0.0/0");
        assert_eq!(parse_peer("2001:db8::1").unwrap().to_string(), "2001:db8::1/128");
        assert!(parse_peer("not-an-ip").is_err());
    }

    #[test]
    fn bucket_arn_derived_from_name() {
        let env = source(&[
            ("CPU_AMI_ID", "ami-123"),
            ("CPU_INSTANCE_TYPE", "m5.2xlarge"),
            ("S3_BUCKET_NAME", "models"),
        ]);
        let config = StackConfiguration::resolve(&cli(&[]), &env).unwrap();
        let bucket = config.bucket.expect("bucket configured");
        assert_eq!(bucket.arn, "arn:aws:s3:::models");
        assert_eq!(bucket.arn_wildcard, "arn:aws:s3:::models/*");
    }

    #[test]
    fn bucket_arn_must_look_like_an_arn() {
        let err = resolve_bucket(None, Some("models".into()), None).unwrap_err();
        assert!(err.to_string().contains("arn:"), "{err}");
        assert!(resolve_bucket(None, None, None).unwrap().is_none());
    }

    #[test]
    fn models_parse_from_comma_list() {
        assert_eq!(
            parse_models(Some(" llama3:8b , ,mistral ")).unwrap(),
            vec!["llama3:8b", "mistral"]
        );
        assert!(parse_models(Some(" , ")).is_err());
        assert!(parse_models(Some("evil; rm -rf /")).is_err());
    }

    #[test]
    fn dotenv_files_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nexport USE_GPU=true\nCPU_AMI_ID=\"ami-1\"\nKEY_PAIR_NAME='k'\n\n",
        )
        .unwrap();
        let entries = load_env_file(&path).unwrap();
        assert_eq!(entries["USE_GPU"], "true");
        assert_eq!(entries["CPU_AMI_ID"], "ami-1");
        assert_eq!(entries["KEY_PAIR_NAME"], "k");

        fs::write(&path, "NOT A PAIR\n").unwrap();
        assert!(load_env_file(&path).unwrap_err().is_configuration());
    }

    #[test]
    fn dotenv_inline_comments_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "PEER_IP=203.0.113.7 # office\nCPU_AMI_ID=ami-123\n").unwrap();
        let entries = load_env_file(&path).unwrap();
        assert_eq!(entries["PEER_IP"], "203.0.113.7");

        let env = source(&[("CPU_INSTANCE_TYPE", "m5.2xlarge")]).with_file_entries(entries);
        let config = StackConfiguration::resolve(&cli(&[]), &env).unwrap();
        assert_eq!(config.peer_cidr.to_string(), "203.0.113.7/32");
        assert_eq!(config.peer_scope, PeerScope::Explicit);
    }

    #[test]
    fn toml_tables_parse_flat() {
        let entries =
            parse_toml_entries("USE_GPU = true\nVOLUME_SIZE_GIB = 200\nCPU_AMI_ID = \"ami-1\"")
                .unwrap();
        assert_eq!(entries["USE_GPU"], "true");
        assert_eq!(entries["VOLUME_SIZE_GIB"], "200");
        assert!(parse_toml_entries("[nested]\nkey = 1").is_err());
    }

    #[test]
    fn log_flag_wins_over_rust_log() {
        let env = source(&[("RUST_LOG", "stack_synth=debug")]);
        assert_eq!(LogSettings::resolve(&cli(&[]), &env).filter, "stack_synth=debug");
        let settings = LogSettings::resolve(&cli(&["--log-level", "info", "--log-format", "json"]), &env);
        assert_eq!(settings.filter, "info");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(LogSettings::resolve(&cli(&[]), &source(&[])).filter, "warn");
    }

    #[test]
    fn deploy_requires_output_dir() {
        let err = DriverConfig::from_source(cli(&["--deploy", "--yes"]), &cpu_source()).unwrap_err();
        assert!(err.to_string().contains("--output-dir"), "{err}");
    }

    #[test]
    fn parameters_expose_configuration() {
        let config = StackConfiguration::resolve(&cli(&[]), &cpu_source()).unwrap();
        assert_eq!(
            config.parameter("instance_type"),
            Some(PropertyValue::String("m5.2xlarge".into()))
        );
        assert_eq!(config.parameter("network_id"), None);
        let config = config.with_network_id("vpc-1");
        assert_eq!(
            config.parameter("network_id"),
            Some(PropertyValue::String("vpc-1".into()))
        );
        assert_eq!(config.parameter("nope"), None);
    }
}
