//! `ski:cache` host module and the in-memory cache behind it

use dashmap::DashMap;
use rquickjs::function::Opt;
use rquickjs::{ArrayBuffer, Ctx, Exception, FromJs, Function, Object, TypedArray, Value};
use ski_engine::{to_json, Cache, HostContext, HostModule};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Concurrent in-memory [`Cache`] with per-entry expiry.
///
/// Expired entries are dropped lazily, when read.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        // The read guard must be released before removing.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        debug!(key, "cache entry expired");
        None
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// Parse a TTL: a number of milliseconds or a duration string such as
/// `"1500ms"`, `"2s"`, `"5m"` or `"1h"`. A bare number string is
/// milliseconds. Zero means no expiry.
pub fn parse_ttl(text: &str) -> Result<Option<Duration>, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let amount: f64 = number
        .parse()
        .map_err(|_| format!("invalid ttl {:?}", text))?;
    let millis = match unit.trim() {
        "" | "ms" => amount,
        "s" => amount * 1_000.0,
        "m" => amount * 60_000.0,
        "h" => amount * 3_600_000.0,
        other => return Err(format!("invalid ttl unit {:?} in {:?}", other, text)),
    };
    Ok(millis_to_ttl(millis))
}

/// Out-of-range TTLs saturate to `Duration::MAX`, which never expires
fn millis_to_ttl(millis: f64) -> Option<Duration> {
    if !(millis.is_finite() && millis > 0.0) {
        return None;
    }
    Some(Duration::try_from_secs_f64(millis / 1_000.0).unwrap_or(Duration::MAX))
}

/// `require("ski:cache")`
pub struct CacheModule {
    cache: Arc<dyn Cache>,
    default_ttl: Option<Duration>,
}

impl CacheModule {
    /// Expose `cache` to scripts; `default_ttl` applies when a call passes none
    pub fn new(cache: Arc<dyn Cache>, default_ttl: Option<Duration>) -> Self {
        Self { cache, default_ttl }
    }
}

impl HostModule for CacheModule {
    fn instantiate<'js>(&self, ctx: &Ctx<'js>, _host: &HostContext) -> rquickjs::Result<Value<'js>> {
        let exports = Object::new(ctx.clone())?;

        let cache = self.cache.clone();
        exports.set(
            "get",
            Function::new(ctx.clone(), move |key: String| {
                cache
                    .get(&key)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })?,
        )?;

        let cache = self.cache.clone();
        exports.set(
            "getBytes",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String| -> rquickjs::Result<Option<ArrayBuffer<'js>>> {
                    cache
                        .get(&key)
                        .map(|bytes| ArrayBuffer::new(ctx.clone(), bytes))
                        .transpose()
                },
            )?,
        )?;

        let (cache, default_ttl) = (self.cache.clone(), self.default_ttl);
        exports.set(
            "set",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String, value: Value<'js>, ttl: Opt<Value<'js>>| {
                    let ttl = ttl_arg(&ctx, ttl.0)?.or(default_ttl);
                    let text = text_of(&ctx, value)?;
                    cache.set(&key, text.into_bytes(), ttl);
                    Ok::<_, rquickjs::Error>(())
                },
            )?,
        )?;

        let (cache, default_ttl) = (self.cache.clone(), self.default_ttl);
        exports.set(
            "setBytes",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, key: String, value: Value<'js>, ttl: Opt<Value<'js>>| {
                    let ttl = ttl_arg(&ctx, ttl.0)?.or(default_ttl);
                    let bytes = bytes_of(&ctx, &value)?.ok_or_else(|| {
                        Exception::throw_type(&ctx, "setBytes expects an ArrayBuffer or Uint8Array")
                    })?;
                    cache.set(&key, bytes, ttl);
                    Ok::<_, rquickjs::Error>(())
                },
            )?,
        )?;

        let cache = self.cache.clone();
        exports.set(
            "del",
            Function::new(ctx.clone(), move |key: String| cache.delete(&key))?,
        )?;

        Ok(exports.into_value())
    }
}

fn ttl_arg<'js>(ctx: &Ctx<'js>, ttl: Option<Value<'js>>) -> rquickjs::Result<Option<Duration>> {
    let Some(ttl) = ttl.filter(|ttl| !ttl.is_undefined() && !ttl.is_null()) else {
        return Ok(None);
    };
    if let Some(millis) = ttl.as_number() {
        return Ok(millis_to_ttl(millis));
    }
    match ttl.as_string() {
        Some(text) => parse_ttl(&text.to_string()?)
            .map_err(|message| Exception::throw_type(ctx, &message)),
        None => Err(Exception::throw_type(ctx, "ttl must be a number or a duration string")),
    }
}

/// Strings are stored as is; anything else as its JSON text
fn text_of<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<String> {
    if let Some(text) = value.as_string() {
        return text.to_string();
    }
    to_json(ctx, value)
        .map(|json| json.to_string())
        .map_err(|err| err.throw(ctx))
}

/// Bytes of an `ArrayBuffer` or `Uint8Array`
pub(crate) fn bytes_of<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Option<Vec<u8>>> {
    if let Ok(buffer) = ArrayBuffer::from_js(ctx, value.clone()) {
        return Ok(buffer.as_bytes().map(<[u8]>::to_vec));
    }
    if let Ok(array) = TypedArray::<u8>::from_js(ctx, value.clone()) {
        return Ok(array.as_bytes().map(<[u8]>::to_vec));
    }
    Ok(None)
}
