//! Ski command-line runner
//!
//! `ski run <file>` runs a script or module file on the VM pool and prints
//! its JSON result; `ski eval <code>` does the same for a script string.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use ski_runtime::{logging, Config};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ski")]
#[command(about = "Run Ski scripts", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ski.toml in the working directory, if any)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, overriding the configured level
    #[arg(long, global = true, value_name = "FILTER")]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script or module file
    Run {
        /// Input file
        file: PathBuf,
        /// Abort the run after this many seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<f64>,
        /// JSON argument for the file's default export (repeatable)
        #[arg(long = "arg", value_name = "JSON")]
        args: Vec<String>,
    },

    /// Evaluate a script string
    Eval {
        /// Script source
        code: String,
        /// Abort the run after this many seconds
        #[arg(short, long, value_name = "SECS")]
        timeout: Option<f64>,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("Failed to load {}", path.display()))
        }
        None => Config::discover(Path::new(".")).context("Failed to load ski.toml"),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    logging::init(cli.log.as_deref().unwrap_or(&config.log.level))
        .context("Failed to initialise logging")?;

    match cli.command {
        Commands::Run {
            file,
            timeout,
            args,
        } => commands::run::execute(config, &file, timeout, &args),
        Commands::Eval { code, timeout } => commands::eval::execute(config, &code, timeout),
    }
}
