//! Script values held between host calls
//!
//! A value that must outlive the host call that received it (a promise's
//! resolve function, a timer callback, a per-VM module instance, an
//! unobserved rejection) stays inside its VM, on a hidden global object.
//! Rust code keeps only a [`Slot`] id. Ids are plain integers, so they can
//! travel with resolvers to any thread while the values never leave the VM.

use super::error::describe;
use rquickjs::object::Property;
use rquickjs::{Array, Ctx, Object, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hidden global holding every table below
const STORE: &str = "__ski_slots";
/// Values kept for pending async work of the active run
const VALUES: &str = "values";
/// Per-VM module instances by module id
const INSTANCES: &str = "instances";
/// `[promise, reason]` pairs no handler has observed yet
const REJECTIONS: &str = "rejections";

/// Id of a script value kept on its VM.
///
/// A slot is valid on the VM that created it until it is taken or the run
/// that created it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(u64);

impl Slot {
    /// Remove the kept value and return it; `undefined` if it is gone
    pub fn take<'js>(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        let values = table(ctx, VALUES)?;
        let key = self.0.to_string();
        let value: Value<'js> = values.get(&*key)?;
        values.remove(&*key)?;
        Ok(value)
    }

    /// Drop the kept value without reading it
    pub fn release(self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        table(ctx, VALUES)?.remove(self.0.to_string())
    }
}

/// Slot allocator of one VM
pub(crate) struct Slots {
    next: AtomicU64,
}

impl Slots {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Create the hidden store on a fresh context
    pub(crate) fn install(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let store = Object::new(ctx.clone())?;
        store.set(VALUES, Object::new(ctx.clone())?)?;
        store.set(INSTANCES, Object::new(ctx.clone())?)?;
        store.set(REJECTIONS, Array::new(ctx.clone())?)?;
        ctx.globals().prop(STORE, Property::from(store))
    }

    /// Keep `value` until its slot is taken or the run ends
    pub(crate) fn keep<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Slot> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        table(ctx, VALUES)?.set(id.to_string(), value)?;
        Ok(Slot(id))
    }

    /// Forget every kept value; called when a run ends
    pub(crate) fn clear_values(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let store: Object<'_> = ctx.globals().get(STORE)?;
        store.set(VALUES, Object::new(ctx.clone())?)
    }

    pub(crate) fn instance<'js>(ctx: &Ctx<'js>, id: &str) -> rquickjs::Result<Option<Value<'js>>> {
        let instances = table(ctx, INSTANCES)?;
        if !instances.contains_key(id)? {
            return Ok(None);
        }
        instances.get(id).map(Some)
    }

    pub(crate) fn set_instance<'js>(
        ctx: &Ctx<'js>,
        id: &str,
        value: Value<'js>,
    ) -> rquickjs::Result<()> {
        table(ctx, INSTANCES)?.set(id, value)
    }

    pub(crate) fn remove_instance(ctx: &Ctx<'_>, id: &str) -> rquickjs::Result<()> {
        table(ctx, INSTANCES)?.remove(id)
    }

    /// Engine rejection-tracker hook
    pub(crate) fn track_rejection<'js>(
        ctx: &Ctx<'js>,
        promise: Value<'js>,
        reason: Value<'js>,
        handled: bool,
    ) -> rquickjs::Result<()> {
        let store: Object<'js> = ctx.globals().get(STORE)?;
        let rejections: Array<'js> = store.get(REJECTIONS)?;
        if !handled {
            let pair = Array::new(ctx.clone())?;
            pair.set(0, promise)?;
            pair.set(1, reason)?;
            return rejections.set(rejections.len(), pair);
        }

        let kept = Array::new(ctx.clone())?;
        for pair in rejections.iter::<Array<'js>>() {
            let pair = pair?;
            let tracked: Value<'js> = pair.get(0)?;
            if tracked != promise {
                kept.set(kept.len(), pair)?;
            }
        }
        store.set(REJECTIONS, kept)
    }

    /// Take the first unhandled rejection, formatted; forget the rest
    pub(crate) fn take_rejection(ctx: &Ctx<'_>) -> rquickjs::Result<Option<String>> {
        let store: Object<'_> = ctx.globals().get(STORE)?;
        let rejections: Array<'_> = store.get(REJECTIONS)?;
        if rejections.is_empty() {
            return Ok(None);
        }
        store.set(REJECTIONS, Array::new(ctx.clone())?)?;
        let first: Array<'_> = rejections.get(0)?;
        let reason: Value<'_> = first.get(1)?;
        Ok(Some(describe(ctx, reason)))
    }
}

fn table<'js>(ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Object<'js>> {
    let store: Object<'js> = ctx.globals().get(STORE)?;
    store.get(name)
}
