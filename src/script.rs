use serde::Serialize;

use crate::config::StackConfiguration;

pub const SHEBANG: &str = "#!/bin/bash";

/// Predicate deciding whether a step is emitted for a given configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    GpuOnly,
    CpuOnly,
}

impl Condition {
    pub fn holds(&self, config: &StackConfiguration) -> bool {
        match self {
            Condition::Always => true,
            Condition::GpuOnly => config.use_gpu,
            Condition::CpuOnly => !config.use_gpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "text")]
pub enum BootCommand {
    Comment(String),
    Line(String),
    /// Multi-line shell fragment kept together, e.g. a heredoc.
    Block(Vec<String>),
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootStep {
    pub command: BootCommand,
    pub condition: Condition,
}

impl BootStep {
    pub fn line(text: impl Into<String>) -> Self {
        Self::always(BootCommand::Line(text.into()))
    }

    pub fn comment(text: impl Into<String>) -> Self {
        Self::always(BootCommand::Comment(text.into()))
    }

    pub fn block<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::always(BootCommand::Block(lines.into_iter().map(Into::into).collect()))
    }

    pub fn blank() -> Self {
        Self::always(BootCommand::Blank)
    }

    pub fn when(self, condition: Condition) -> Self {
        Self { condition, ..self }
    }

    fn always(command: BootCommand) -> Self {
        Self {
            command,
            condition: Condition::Always,
        }
    }
}

/// One GPU step and one CPU step occupying the same position in the script.
pub fn gpu_or_cpu(gpu: impl Into<String>, cpu: impl Into<String>) -> [BootStep; 2] {
    [
        BootStep::line(gpu).when(Condition::GpuOnly),
        BootStep::line(cpu).when(Condition::CpuOnly),
    ]
}

/// Render the steps whose condition holds, in declaration order. Steps run
/// top to bottom on first boot; nothing here retries or rolls back.
pub fn compose_script(steps: &[BootStep], config: &StackConfiguration) -> String {
    let mut script = String::from(SHEBANG);
    script.push('\n');
    for step in steps.iter().filter(|step| step.condition.holds(config)) {
        match &step.command {
            BootCommand::Comment(text) => {
                script.push_str("# ");
                script.push_str(text);
            }
            BootCommand::Line(text) => script.push_str(text),
            BootCommand::Block(lines) => script.push_str(&lines.join("\n")),
            BootCommand::Blank => {}
        }
        script.push('\n');
    }
    script
}
