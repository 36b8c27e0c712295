//! `ski run`: Run a script or module file.

use super::{print_result, run_context};
use anyhow::Context;
use ski_runtime::{Config, Runtime};
use std::path::Path;

pub fn execute(
    config: Config,
    file: &Path,
    timeout: Option<f64>,
    args: &[String],
) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let args = parse_args(args)?;
    let ctx = run_context(timeout)?;
    let runtime = Runtime::new(config).context("Failed to start runtime")?;

    // Arguments go to the default export, so the file must be loaded as a module.
    let value = if args.is_empty() {
        runtime.run_file(&ctx, file)?
    } else {
        runtime.run_file_export(&ctx, file, &args)?
    };
    print_result(&value)
}

fn parse_args(args: &[String]) -> anyhow::Result<Vec<serde_json::Value>> {
    args.iter()
        .map(|arg| {
            serde_json::from_str(arg).with_context(|| format!("--arg {:?} is not valid JSON", arg))
        })
        .collect()
}
