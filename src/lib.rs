#![forbid(unsafe_code)]

pub mod config;
pub mod diff;
pub mod driver;
pub mod error;
pub mod graph;
pub mod iac;
pub mod model;
pub mod providers;
pub mod script;
pub mod stack;
pub mod synth;
pub mod telemetry;

pub use config::{ArtifactFormat, CliArgs, ConfigSource, DriverConfig, StackConfiguration};
pub use error::{Result, SynthError};
pub use graph::{DependencyGraph, build_graph};
pub use model::{IngressRule, PropertyValue, Reference, ResourceKind, ResourceNode, Stack};
pub use script::{BootStep, Condition, compose_script};
pub use synth::{Artifact, ArtifactManifest, synthesize};
