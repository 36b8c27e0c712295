//! Process-wide log output

use crate::error::{RuntimeError, RuntimeResult};
use tracing_subscriber::{fmt, EnvFilter};

/// Install a stderr subscriber filtered at `level`.
///
/// `RUST_LOG` overrides the level when set. Only binaries should call this.
pub fn init(level: &str) -> RuntimeResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|err| RuntimeError::InvalidConfig(format!("log level {:?}: {}", level, err)))?,
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| RuntimeError::InvalidConfig(err.to_string()))
}
