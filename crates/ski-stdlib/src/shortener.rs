//! `ski:shortener` host module
//!
//! Stores request templates under short ids so a task can hand an id to
//! another script instead of the full template text. Ids are derived from
//! the template, so storing the same template twice yields the same id.

use rquickjs::{Ctx, Function, Object, Value};
use rustc_hash::FxHasher;
use ski_engine::{Cache, HostContext, HostModule};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Cache key prefix of stored templates
const KEY_PREFIX: &str = "shortener:";

/// Template store on top of a [`Cache`]
#[derive(Clone)]
pub struct Shortener {
    cache: Arc<dyn Cache>,
}

impl Shortener {
    /// Store templates in `cache`
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    /// Store `template` and return its id
    pub fn set(&self, template: &str) -> String {
        let id = short_id(template);
        self.cache
            .set(&key(&id), template.as_bytes().to_vec(), None);
        id
    }

    /// Template stored under `id`
    pub fn get(&self, id: &str) -> Option<String> {
        self.cache
            .get(&key(id))
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Forget the template stored under `id`
    pub fn delete(&self, id: &str) {
        self.cache.delete(&key(id));
    }
}

fn key(id: &str) -> String {
    format!("{}{}", KEY_PREFIX, id)
}

fn short_id(template: &str) -> String {
    let mut hasher = FxHasher::default();
    template.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// `require("ski:shortener")`
pub struct ShortenerModule {
    shortener: Shortener,
}

impl ShortenerModule {
    /// Expose `shortener` to scripts
    pub fn new(shortener: Shortener) -> Self {
        Self { shortener }
    }
}

impl HostModule for ShortenerModule {
    fn instantiate<'js>(&self, ctx: &Ctx<'js>, _host: &HostContext) -> rquickjs::Result<Value<'js>> {
        let exports = Object::new(ctx.clone())?;

        let shortener = self.shortener.clone();
        exports.set(
            "set",
            Function::new(ctx.clone(), move |template: String| shortener.set(&template))?,
        )?;

        let shortener = self.shortener.clone();
        exports.set(
            "get",
            Function::new(ctx.clone(), move |id: String| shortener.get(&id))?,
        )?;

        let shortener = self.shortener.clone();
        exports.set(
            "del",
            Function::new(ctx.clone(), move |id: String| shortener.delete(&id))?,
        )?;

        Ok(exports.into_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[test]
    fn test_set_then_get() {
        let cache = Arc::new(MemoryCache::new());
        let shortener = Shortener::new(cache.clone());
        let template = "POST http://localhost\nContent-Type: application/json\n\n{\"key\":\"foo\"}";
        let id = shortener.set(template);
        assert_eq!(shortener.get(&id).as_deref(), Some(template));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_same_template_same_id() {
        let shortener = Shortener::new(Arc::new(MemoryCache::new()));
        let first = shortener.set("GET http://a.test");
        assert_eq!(shortener.set("GET http://a.test"), first);
        assert_ne!(shortener.set("GET http://b.test"), first);
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn test_delete_and_unknown_id() {
        let shortener = Shortener::new(Arc::new(MemoryCache::new()));
        let id = shortener.set("GET http://a.test");
        shortener.delete(&id);
        assert!(shortener.get(&id).is_none());
        assert!(shortener.get("missing").is_none());
    }
}
