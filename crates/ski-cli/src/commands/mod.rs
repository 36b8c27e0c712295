//! Subcommand implementations

pub mod eval;
pub mod run;

use anyhow::Context;
use ski_engine::RunContext;
use std::time::Duration;

/// Run context for a command, bounded by `--timeout` when given
pub fn run_context(timeout: Option<f64>) -> anyhow::Result<RunContext> {
    let ctx = RunContext::background();
    match timeout {
        Some(secs) => {
            let timeout = Duration::try_from_secs_f64(secs)
                .with_context(|| format!("Invalid timeout {}", secs))?;
            Ok(ctx.with_timeout(timeout))
        }
        None => Ok(ctx),
    }
}

/// Print a run result as JSON on stdout
pub fn print_result(value: &serde_json::Value) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to format result")?;
    println!("{}", text);
    Ok(())
}
