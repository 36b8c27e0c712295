//! Cache contract
//!
//! A best-effort side store. Writes never fail from the caller's point of
//! view: implementations log their own errors.

use std::time::Duration;

/// Key/value byte store with optional expiry
pub trait Cache: Send + Sync {
    /// Stored bytes for `key`, if present and not expired
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store `value` under `key`; `None` means no expiry
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>);

    /// Remove `key`
    fn delete(&self, key: &str);
}
