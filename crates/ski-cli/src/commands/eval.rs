//! `ski eval`: Evaluate an inline script.

use super::{print_result, run_context};
use anyhow::Context;
use ski_runtime::{Config, Runtime};

pub fn execute(config: Config, code: &str, timeout: Option<f64>) -> anyhow::Result<()> {
    let ctx = run_context(timeout)?;
    let runtime = Runtime::new(config).context("Failed to start runtime")?;
    let value = runtime.run_string(&ctx, code)?;
    print_result(&value)
}
