//! devicebox-update - run the self-update engine from a shell or timer.
//!
//! Prints the outcome as JSON on stdout; logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use devicebox_common::{logging, UpdaterConfig, VERSION};
use devicebox_update::UpdateOrchestrator;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code for usage and configuration errors
const EXIT_CONFIG: u8 = 64;

#[derive(Parser)]
#[command(name = "devicebox-update")]
#[command(about = "DeviceBox self-update engine", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    /// Config file (default: $DEVICEBOX_UPDATER_CONFIG or /etc/devicebox/updater.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether a newer build is published
    Check,

    /// Download and install the latest build
    Apply,

    /// Show the installed version record
    Status,

    /// Undo leftovers of an interrupted update
    Recover,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("devicebox-update: {:#}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = UpdaterConfig::load(cli.config.as_deref())?;
    let orchestrator = UpdateOrchestrator::from_config(&config)?;

    let code = match cli.command {
        Commands::Check => {
            let outcome = orchestrator.check().await;
            print_json(&outcome)?;
            u8::from(outcome.error.is_some())
        }
        Commands::Apply => {
            let outcome = orchestrator.apply().await;
            print_json(&outcome)?;
            exit_byte(outcome.exit_code())
        }
        Commands::Status => match orchestrator.installed() {
            Ok(record) => {
                print_json(&json!({
                    "installed": record,
                    "install_dir": config.install.install_dir,
                }))?;
                0
            }
            Err(e) => {
                print_json(&json!({ "installed": null, "error": e.kind(), "message": e.to_string() }))?;
                exit_byte(e.exit_code())
            }
        },
        Commands::Recover => match orchestrator.recover().await {
            Ok(report) => {
                print_json(&report)?;
                0
            }
            Err(e) => {
                print_json(&json!({ "error": e.kind(), "message": e.to_string() }))?;
                exit_byte(e.exit_code())
            }
        },
    };
    Ok(code)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
