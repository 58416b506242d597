use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LogSettings};
use crate::error::{Result, SynthError};

/// Install the stderr subscriber. Stdout carries the artifact, so logs never
/// go there. A second call keeps the first subscriber.
pub fn init(settings: &LogSettings) -> Result<()> {
    let filter = filter(&settings.filter)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match settings.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

fn filter(directives: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directives)
        .map_err(|err| SynthError::Config(format!("invalid log filter '{directives}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_level_and_module_directives() {
        assert!(filter("warn").is_ok());
        assert!(filter("stack_synth=debug,info").is_ok());
    }

    #[test]
    fn rejects_malformed_filters() {
        let err = filter("stack_synth=loud").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn init_twice_is_harmless() {
        let settings = LogSettings {
            filter: "warn".into(),
            format: LogFormat::Text,
        };
        init(&settings).unwrap();
        init(&settings).unwrap();
    }
}
