//! Bridging script promises onto the callback protocol

use super::EventLoop;
use crate::vm::convert::to_json;
use crate::vm::error::describe;
use crate::vm::{VmError, VmResult};
use parking_lot::Mutex;
use rquickjs::function::This;
use rquickjs::{Ctx, Function, Value};
use std::sync::Arc;

/// Slot the terminal value of a run settles into
pub(crate) type Outcome = Arc<Mutex<Option<VmResult<serde_json::Value>>>>;

/// Settle `value` into `outcome`.
///
/// Plain values settle at once. A promise gets handlers attached and a
/// weak callback registered on `events`, so it settles while the loop
/// drains; a rejection settles as [`VmError::UncaughtRejection`].
pub(crate) fn bridge<'js>(
    ctx: &Ctx<'js>,
    events: &EventLoop<'_>,
    value: Value<'js>,
    outcome: Outcome,
) -> VmResult<()> {
    let Some(promise) = value.as_promise().cloned() else {
        *outcome.lock() = Some(to_json(ctx, value));
        return Ok(());
    };

    let resolver = Arc::new(events.register_weak());
    let attach = || -> rquickjs::Result<()> {
        let (slot, done) = (outcome.clone(), resolver.clone());
        let on_fulfilled = Function::new(ctx.clone(), move |ctx: Ctx<'js>, value: Value<'js>| {
            *slot.lock() = Some(to_json(&ctx, value));
            done.resolve(|_| Ok(()));
        })?;

        let on_rejected = Function::new(ctx.clone(), move |ctx: Ctx<'js>, reason: Value<'js>| {
            *outcome.lock() = Some(Err(VmError::UncaughtRejection(describe(&ctx, reason))));
            resolver.resolve(|_| Ok(()));
        })?;

        let then: Function<'js> = promise.get("then")?;
        then.call::<_, ()>((This(promise.clone()), on_fulfilled, on_rejected))
    };
    attach().map_err(|err| VmError::from_js(ctx, err))
}
