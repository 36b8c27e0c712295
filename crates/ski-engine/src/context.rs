//! Run-scoped context
//!
//! A `RunContext` travels with one run: it carries the run's deadline, an
//! explicit cancellation flag, and caller-scoped data (request identity,
//! parser state, ...) that host bindings read while the run is active.
//! Contexts derived with the `with_*` builders share the cancellation flag
//! of the context they were derived from.

use crate::vm::VmError;
use rustc_hash::FxHashMap;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline, cancellation and data scoped to a single run
#[derive(Clone, Default)]
pub struct RunContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
    values: Arc<FxHashMap<String, serde_json::Value>>,
    extensions: Arc<FxHashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl RunContext {
    /// A context with no deadline and no data
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires `timeout` from now.
    ///
    /// An earlier deadline already present is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Derive a context that expires at `deadline` (or earlier, if already set)
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// Attach a JSON value under `key`
    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        Arc::make_mut(&mut self.values).insert(key.into(), value);
        self
    }

    /// Attach a typed extension, replacing any previous value of the same type
    pub fn with_extension<T: Any + Send + Sync>(mut self, value: T) -> Self {
        Arc::make_mut(&mut self.extensions).insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    /// The run deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancel this context and every context sharing its flag
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the context was cancelled or its deadline elapsed
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason the context is done, if it is
    pub fn err(&self) -> Option<VmError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Some(VmError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(VmError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Look up a JSON value attached with [`RunContext::with_value`]
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Look up a typed extension attached with [`RunContext::with_extension`]
    pub fn extension<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.extensions
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .field("values", &self.values)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug, PartialEq)]
    struct RequestId(u64);

    #[test]
    fn test_background_is_never_done() {
        let ctx = RunContext::background();
        assert!(!ctx.is_done());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn test_timeout_expires() {
        let ctx = RunContext::background().with_timeout(Duration::from_millis(10));
        assert!(!ctx.is_done());
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(ctx.err(), Some(VmError::DeadlineExceeded)));
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let early = Instant::now() + Duration::from_millis(50);
        let ctx = RunContext::background()
            .with_deadline(early)
            .with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(early));
    }

    #[test]
    fn test_cancel_is_shared_with_derived() {
        let parent = RunContext::background();
        let child = parent.clone().with_value("id", serde_json::json!("abc"));
        parent.cancel();
        assert!(matches!(child.err(), Some(VmError::Cancelled)));
    }

    #[test]
    fn test_values_and_extensions() {
        let ctx = RunContext::background()
            .with_value("user", serde_json::json!({"name": "ski"}))
            .with_extension(RequestId(7));

        assert_eq!(ctx.value("user"), Some(&serde_json::json!({"name": "ski"})));
        assert_eq!(ctx.value("missing"), None);
        assert_eq!(ctx.extension::<RequestId>(), Some(&RequestId(7)));
        assert_eq!(ctx.extension::<String>(), None);
    }
}
