//! Runtime error types.

use ski_engine::VmError;
use ski_stdlib::StdlibError;

/// Errors that can occur while configuring the runtime or running scripts.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// `ski.toml` does not parse
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    /// A configuration value is out of range
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Host services could not be built
    #[error("Stdlib error: {0}")]
    Stdlib(#[from] StdlibError),

    /// Script execution error
    #[error("{0}")]
    Vm(#[from] VmError),
}

/// Result alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
