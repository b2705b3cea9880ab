//! Run filesystem command scripts against an in-memory container store.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use containerfs::ContainerFs;
use tracing::{debug, error, info};

mod app_config;
mod script;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "Filesystem-like access to a remote, versioned container store."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a containerfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script file, one command per line. Reads stdin if no file is given.
    Run {
        /// The script to run.
        script: Option<PathBuf>,
    },

    /// Run the given commands, one per argument.
    Exec {
        /// Commands such as "put /_documents/a.txt hello".
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

fn read_script(command: Command) -> std::io::Result<String> {
    match command {
        Command::Run { script: Some(path) } => std::fs::read_to_string(path),
        Command::Run { script: None } => std::io::read_to_string(std::io::stdin()),
        Command::Exec { commands } => Ok(commands.join("\n")),
    }
}

async fn execute(config: &Config, source: &str) -> Result<(), script::ScriptError> {
    let steps = script::parse(source)?;
    let (store, root) =
        script::seed_store(config.store.quota_bytes, &config.store.default_containers)?;
    let fs = ContainerFs::new(store, root);
    fs.initialize()
        .await
        .map_err(|source| script::ScriptError::Command { line: 0, source })?;

    let mut out = std::io::stdout().lock();
    script::run(&fs, &steps, &mut out).await?;

    let stats = fs.stats();
    info!(
        steps = steps.len(),
        open_descriptors = stats.open_descriptors,
        nodes = stats.nodes,
        cached_results = stats.cached_results,
        low_balance = stats.low_balance,
        "script finished"
    );
    Ok(())
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    Trc::from_env_or(&config.log.level)
        .init()
        .unwrap_or_else(|e| {
            eprintln!(
                "Failed to initialize logging. Without logging, we can't provide any useful error \
                 messages, so we have to exit: {e}"
            );
            std::process::exit(1);
        });
    debug!(config = ?config, "Loaded configuration.");

    let source = match read_script(args.command) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to read script: {e}");
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the async runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(execute(&config, &source)) {
        error!("{e}");
        std::process::exit(1);
    }
}
