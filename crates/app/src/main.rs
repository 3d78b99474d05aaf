mod cli;
mod probe;
mod run;

use anyhow::{Result, bail};
use clap::Parser;
use vision::{
    RestartChain,
    pipeline::{TelemetryOptions, config::HealthConfig, telemetry},
};

use crate::cli::{Cli, Command};

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let telemetry_opts = TelemetryOptions::from(cli.telemetry);
    let _telemetry_guard = telemetry::enter_runtime(&telemetry_opts);
    telemetry::init_metrics_recorder(&telemetry_opts);

    match cli.command {
        Command::Run(args) => run::run(args),
        Command::Probe(args) => probe::run(args),
        Command::RestartService(args) => {
            let config = HealthConfig::try_from(args.health)?;
            let chain = RestartChain::from_config(&config.restart)?;
            if !chain.restart() {
                bail!("could not restart service {}", chain.service());
            }
            Ok(())
        }
    }
}
