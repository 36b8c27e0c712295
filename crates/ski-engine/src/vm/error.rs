//! VM error taxonomy and uncaught-value formatting

use crate::module::ModuleError;
use rquickjs::{Coerced, Ctx, Exception, FromJs, Value};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by compiling or running scripts
#[derive(Debug, Clone, Error)]
pub enum VmError {
    /// Malformed script or module source
    #[error("{0}")]
    Syntax(String),

    /// Module resolution or loading failed
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// The run's deadline elapsed
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The run was cancelled or interrupted
    #[error("context canceled")]
    Cancelled,

    /// No VM became available within the acquisition budget
    #[error("vm pool exhausted after {retries} retries ({waited:?})")]
    PoolExhausted {
        /// Acquisition attempts made
        retries: u32,
        /// Time spent waiting
        waited: Duration,
    },

    /// Uncaught synchronous script error
    #[error("{0}")]
    Exception(String),

    /// Rejected promise that no handler observed
    #[error("Uncaught (in promise) {0}")]
    UncaughtRejection(String),

    /// The run's result promise never settled
    #[error("unexpected promise pending state")]
    PendingPromise,

    /// A host binding needed an active run and found none
    #[error("no active run on vm {0}")]
    NoActiveRun(usize),

    /// Engine-internal failure
    #[error("engine error: {0}")]
    Engine(String),
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;

impl VmError {
    /// Convert an engine error raised while running script code.
    ///
    /// A pending JS exception is taken off the context and formatted.
    pub fn from_js(ctx: &Ctx<'_>, err: rquickjs::Error) -> Self {
        match err {
            rquickjs::Error::Exception => VmError::Exception(describe(ctx, ctx.catch())),
            other => VmError::Engine(other.to_string()),
        }
    }

    /// Like [`VmError::from_js`], for errors raised while compiling
    pub fn from_compile(ctx: &Ctx<'_>, err: rquickjs::Error) -> Self {
        match VmError::from_js(ctx, err) {
            VmError::Exception(text) => VmError::Syntax(text),
            other => other,
        }
    }

    /// Whether this error ends the run because its context is done
    pub fn is_context_error(&self) -> bool {
        matches!(self, VmError::DeadlineExceeded | VmError::Cancelled)
    }

    /// Raise this error as a JS exception on `ctx`
    pub fn throw(&self, ctx: &Ctx<'_>) -> rquickjs::Error {
        Exception::throw_message(ctx, &self.to_string())
    }
}

/// Format a thrown or rejected value.
///
/// Native errors render as `<Name>: <message>` followed by one `\tat <frame>`
/// line per stack frame; anything else renders as its string form.
pub fn describe<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    if let Some(object) = value.as_object() {
        if let Some(exception) = Exception::from_object(object.clone()) {
            let name = object
                .get::<_, Option<String>>("name")
                .ok()
                .flatten()
                .unwrap_or_else(|| "Error".to_string());
            let mut text = format!("{}: {}", name, exception.message().unwrap_or_default());
            let frames: Vec<String> = exception
                .stack()
                .unwrap_or_default()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| line.strip_prefix("at ").unwrap_or(line).to_string())
                .collect();
            if !frames.is_empty() {
                for frame in frames {
                    text.push_str("\n\tat ");
                    text.push_str(&frame);
                }
                text.push('\n');
            }
            return text;
        }
    }

    match Coerced::<String>::from_js(ctx, value) {
        Ok(Coerced(text)) => text,
        Err(err) => format!("<unprintable value: {}>", err),
    }
}
