//! Open Peer Power server
//!
//! Loads `configuration.yaml` from the config directory, starts the kernel
//! and runs until the `openpeerpower.stop` or `openpeerpower.restart`
//! service is called or the process receives Ctrl-C. The exit code is `0`
//! for a clean stop and `100` when a restart was requested.

use anyhow::{Context as _, Result};
use clap::Parser;
use opp_config::{ensure_config_dir, Configuration};
use opp_runtime::{OpenPeerPower, RuntimeConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Open Peer Power home automation kernel
#[derive(Parser, Debug)]
#[command(name = "openpeerpower")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding configuration.yaml
    #[arg(short, long, value_name = "DIR", default_value = "config")]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn run(args: Args) -> Result<i32> {
    let config_dir = ensure_config_dir(&args.config)
        .with_context(|| format!("unusable config directory {:?}", args.config))?;
    let configuration =
        Configuration::load(&config_dir).context("failed to load configuration")?;

    info!("Starting Open Peer Power from {:?}", config_dir);
    let opp = OpenPeerPower::new(RuntimeConfig::new(config_dir), configuration);
    opp.start().await;

    let exit_code = tokio::select! {
        code = opp.wait_for_stop() => code,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Unable to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down...");
            opp.stop(0).await;
            opp.exit_code()
        }
    };
    Ok(exit_code)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["openpeerpower"]).unwrap();
        assert_eq!(args.config, PathBuf::from("config"));
        assert!(!args.verbose);
    }

    #[test]
    fn test_config_and_verbose() {
        let args = Args::try_parse_from(["openpeerpower", "-v", "--config", "/srv/opp"]).unwrap();
        assert_eq!(args.config, PathBuf::from("/srv/opp"));
        assert!(args.verbose);

        let short = Args::try_parse_from(["openpeerpower", "-c", "/etc/opp"]).unwrap();
        assert_eq!(short.config, PathBuf::from("/etc/opp"));
    }

    #[test]
    fn test_bad_arguments() {
        assert!(Args::try_parse_from(["openpeerpower", "--config"]).is_err());
        assert!(Args::try_parse_from(["openpeerpower", "--frobnicate"]).is_err());
    }
}
