use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SynthError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid resource '{resource}': {message}")]
    Validation { resource: String, message: String },

    #[error("duplicate resource id '{0}'")]
    DuplicateId(String),

    #[error("resource '{resource}' property '{property}' references unknown resource '{target}'")]
    UnknownReference {
        resource: String,
        property: String,
        target: String,
    },

    #[error("dependency cycle detected: {}", nodes.join(" -> "))]
    Cycle { nodes: Vec<String> },

    #[error("resource '{resource}' uses unknown parameter '{parameter}'")]
    UnknownParameter { resource: String, parameter: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(String),

    #[error("TOML parse error: {0}")]
    Toml(String),

    #[error(
        "deploy tool '{tool}' missing on PATH (binary '{binary}'). Install it or choose --deploy-tool."
    )]
    DeployToolMissing { tool: String, binary: &'static str },

    #[error("deploy tool '{tool}' command '{step}' failed (exit {status:?}): {stderr}")]
    DeployTool {
        tool: String,
        step: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("network lookup failed: {0}")]
    Lookup(String),

    #[error("unexpected error: {0}")]
    Other(String),
}

impl SynthError {
    pub fn validation(resource: impl Into<String>, message: impl Into<String>) -> Self {
        SynthError::Validation {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// True for errors detected before any artifact or provider call exists.
    pub fn is_configuration(&self) -> bool {
        matches!(self, SynthError::Config(_))
    }

    pub fn exit_code(&self) -> i32 {
        1
    }
}

pub type Result<T> = std::result::Result<T, SynthError>;
