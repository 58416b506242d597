use clap::Parser;

use stack_synth::{
    config::{CliArgs, ConfigSource, DriverConfig, LogSettings},
    driver, telemetry,
};

fn main() {
    let cli = CliArgs::parse();
    let env = ConfigSource::from_env(std::env::vars());
    // Configuration warnings are emitted while resolving, so logging comes first.
    let result = DriverConfig::load_source(&cli, env)
        .and_then(|source| {
            telemetry::init(&LogSettings::resolve(&cli, &source))?;
            DriverConfig::from_source(cli, &source)
        })
        .and_then(driver::run);
    if let Err(err) = result {
        std::process::exit(driver::report_error(&err));
    }
}
