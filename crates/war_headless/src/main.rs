//! Headless scenario runner.
//!
//! Runs one built-in scenario against freshly started components and prints
//! a JSON summary on stdout. Logs go to stderr; `RUST_LOG` overrides the
//! level.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p war_headless -- run --scenario basic-combat
//! cargo run -p war_headless -- run --scenario stress-test --units 500 --duration-secs 20
//! cargo run -p war_headless -- run --scenario resource-management --config scenarios/fast.ron
//! cargo run -p war_headless -- config --config scenarios/fast.ron
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use war_core::lifecycle::CancelToken;
use war_headless::{
    config::{load_config, to_ron},
    runner::{exit_code, run_scenario},
    ScenarioKind, ScenarioOptions,
};

#[derive(Parser)]
#[command(name = "war_headless")]
#[command(about = "Headless runner for the unit, resource and battle simulation")]
#[command(version)]
struct Cli {
    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and print its summary
    Run {
        /// Scenario to run
        #[arg(short, long, value_enum)]
        scenario: ScenarioKind,

        /// RON config file overriding component settings
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// How long to drive the scenario
        #[arg(short, long, default_value = "10")]
        duration_secs: u64,

        /// Unit count (scenario default if omitted)
        #[arg(short, long)]
        units: Option<usize>,

        /// Per-component shutdown budget
        #[arg(long, default_value = "5")]
        shutdown_timeout_secs: u64,
    },

    /// Print the effective configuration as RON
    Config {
        /// RON config file to validate
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(filter)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            scenario,
            config,
            duration_secs,
            units,
            shutdown_timeout_secs,
        } => {
            let options = ScenarioOptions {
                duration: Duration::from_secs(duration_secs),
                units,
                shutdown_timeout: Duration::from_secs(shutdown_timeout_secs),
            };
            cmd_run(scenario, config, &options)
        }
        Commands::Config { config } => cmd_config(config),
    }
}

fn cmd_run(scenario: ScenarioKind, config: Option<PathBuf>, options: &ScenarioOptions) -> ExitCode {
    let config = match load_config(config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(2);
        }
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async {
        let root = CancelToken::new();
        let interrupt = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, shutting down");
                interrupt.cancel();
            }
        });
        run_scenario(scenario, options, config, &root).await
    });

    match outcome {
        Ok(summary) => match summary.to_json() {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!("Failed to serialize summary: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            tracing::error!(scenario = ?scenario, "{}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn cmd_config(config: Option<PathBuf>) -> ExitCode {
    let config = match load_config(config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(2);
        }
    };
    match to_ron(&config) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Failed to render config: {}", e);
            ExitCode::FAILURE
        }
    }
}
