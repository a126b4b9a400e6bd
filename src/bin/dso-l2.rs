use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dso_l2::config::{self, Config};
use dso_l2::daemon::{InMemoryObjectStore, Server};
use dso_l2::telemetry;

#[derive(Parser, Debug)]
#[command(name = "dso-l2", version, about = "Coordination server for shared objects and distributed locks")]
struct Cli {
    /// Config file. Defaults to $DSO_CONFIG, then the user config directory.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,

    /// Print the effective configuration as TOML and exit.
    #[arg(long, conflicts_with = "check_config")]
    print_config: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };
    if let Some(addr) = &cli.listen {
        cfg.server.listen_addr = addr.clone();
    }

    if cli.check_config {
        println!("configuration ok");
        return ExitCode::SUCCESS;
    }
    if cli.print_config {
        return match toml::to_string_pretty(&cfg) {
            Ok(rendered) => {
                print!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("cannot render configuration: {err}");
                ExitCode::FAILURE
            }
        };
    }

    let _telemetry_guard =
        match telemetry::init(telemetry::TelemetryConfig::new(cli.verbose, cfg.logging.clone())) {
            Ok(guard) => Some(guard),
            Err(err) => {
                eprintln!("telemetry init failed, continuing without logs: {err}");
                None
            }
        };

    match Server::start(&cfg, Arc::new(InMemoryObjectStore::new())) {
        Ok(handle) => {
            handle.join();
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("error: {err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, config::ConfigError> {
    match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    }
}
