//! `require` and module instantiation
//!
//! CommonJS semantics on top of the loader: the referencing module decides
//! how relative specifiers resolve, instances are cached per VM, and a
//! module's `module` object is cached before its body runs so circular
//! requires see the partially filled `exports`.

use super::shared::VmShared;
use super::slots::Slots;
use super::VmError;
use crate::host::{parser_exports, HostContext};
use crate::module::{ModuleKind, ModuleRef};
use rquickjs::function::{Constructor, This};
use rquickjs::{qjs, Ctx, FromJs, Function, Module, Object, Value};
use std::ffi::CString;
use std::sync::Arc;

/// Hidden global that instantiates an already-resolved module by id
pub(crate) const RESOLVED_REQUIRE: &str = "__ski_require";

/// Install `require`, the resolved-id require and every global host binding
pub(crate) fn install<'js>(ctx: &Ctx<'js>, shared: &Arc<VmShared>) -> rquickjs::Result<()> {
    Slots::install(ctx)?;
    let globals = ctx.globals();
    globals.set("require", make_require(ctx, shared.clone(), None)?)?;

    let resolved = shared.clone();
    globals.set(
        RESOLVED_REQUIRE,
        Function::new(ctx.clone(), move |ctx: Ctx<'js>, id: String| {
            let record = resolved.modules.cached(&id).ok_or_else(|| {
                VmError::Engine(format!("module {} was never resolved", id)).throw(&ctx)
            })?;
            instantiate(&ctx, &resolved, &record)
        })?,
    )?;

    let host = HostContext::new(shared.clone());
    for (_, global) in shared.modules.registry().globals() {
        global.install(ctx, &globals, &host)?;
    }
    Ok(())
}

/// Build a `require` function.
///
/// With a `referrer`, specifiers resolve relative to that module; without
/// one the caller's source location is read off the current stack.
pub(crate) fn make_require<'js>(
    ctx: &Ctx<'js>,
    shared: Arc<VmShared>,
    referrer: Option<String>,
) -> rquickjs::Result<Function<'js>> {
    Function::new(ctx.clone(), move |ctx: Ctx<'js>, specifier: String| {
        let referrer = referrer.clone().or_else(|| caller_location(&ctx));
        require(&ctx, &shared, referrer.as_deref(), &specifier)
    })
}

/// Resolve `specifier` from `referrer` and return the module's exports
pub(crate) fn require<'js>(
    ctx: &Ctx<'js>,
    shared: &Arc<VmShared>,
    referrer: Option<&str>,
    specifier: &str,
) -> rquickjs::Result<Value<'js>> {
    let record = shared
        .modules
        .resolve(referrer, specifier)
        .map_err(|err| VmError::from(err).throw(ctx))?;
    instantiate(ctx, shared, &record)
}

/// Instantiate `record` on this VM, or fetch the cached instance
pub(crate) fn instantiate<'js>(
    ctx: &Ctx<'js>,
    shared: &Arc<VmShared>,
    record: &ModuleRef,
) -> rquickjs::Result<Value<'js>> {
    let id = record.id();
    match record.kind() {
        ModuleKind::Native(module) => {
            if let Some(exports) = Slots::instance(ctx, id)? {
                return Ok(exports);
            }
            let exports = module.instantiate(ctx, &HostContext::new(shared.clone()))?;
            Slots::set_instance(ctx, id, exports.clone())?;
            Ok(exports)
        }
        ModuleKind::Parser(parser) => {
            if let Some(exports) = Slots::instance(ctx, id)? {
                return Ok(exports);
            }
            let exports = parser_exports(ctx, parser.clone(), &HostContext::new(shared.clone()))?;
            Slots::set_instance(ctx, id, exports.clone())?;
            Ok(exports)
        }
        ModuleKind::CommonJs(wrapper) | ModuleKind::Json(wrapper) => {
            if let Some(saved) = Slots::instance(ctx, id)? {
                return match saved.as_object() {
                    Some(module) => module.get("exports"),
                    None => Ok(saved),
                };
            }
            let module = Object::new(ctx.clone())?;
            let exports = Object::new(ctx.clone())?;
            module.set("id", id)?;
            module.set("exports", exports.clone())?;
            Slots::set_instance(ctx, id, module.clone().into_value())?;

            let evaluated = evaluate_commonjs(ctx, shared, id, wrapper, &module, exports);
            if let Err(err) = evaluated {
                // Keep the pending exception; removing the instance must not replace it.
                let _ = Slots::remove_instance(ctx, id);
                return Err(err);
            }
            module.get("exports")
        }
        ModuleKind::EsModule(_) => {
            let namespace: Object<'js> = Module::import(ctx, id)?.finish()?;
            let default: Value<'js> = namespace.get("default")?;
            if default.is_undefined() {
                Ok(namespace.into_value())
            } else {
                Ok(default)
            }
        }
    }
}

fn evaluate_commonjs<'js>(
    ctx: &Ctx<'js>,
    shared: &Arc<VmShared>,
    id: &str,
    wrapper: &str,
    module: &Object<'js>,
    exports: Object<'js>,
) -> rquickjs::Result<()> {
    let envelope: Function<'js> = eval_script(ctx, id, wrapper, shared.strict)?;
    let require = make_require(ctx, shared.clone(), Some(id.to_string()))?;
    envelope.call::<_, ()>((This(exports.clone()), exports, require, module.clone()))
}

/// Evaluate script source as global code, with `name` as the file name
/// stack frames report
pub(crate) fn eval_script<'js, V>(
    ctx: &Ctx<'js>,
    name: &str,
    source: &str,
    strict: bool,
) -> rquickjs::Result<V>
where
    V: FromJs<'js>,
{
    let value = eval_raw(ctx, name, source, script_flags(strict))?;
    V::from_js(ctx, value)
}

/// Compile script source as global code without running it
pub(crate) fn compile_script(
    ctx: &Ctx<'_>,
    name: &str,
    source: &str,
    strict: bool,
) -> rquickjs::Result<()> {
    let flags = script_flags(strict) | qjs::JS_EVAL_FLAG_COMPILE_ONLY as i32;
    eval_raw(ctx, name, source, flags).map(drop)
}

/// Wrap a script in a block so its top-level `let`, `const` and `class`
/// bindings belong to one run. The completion value is unchanged and line
/// numbers are kept.
pub(crate) fn scoped(source: &str) -> String {
    format!("{{{}\n}}", source)
}

fn script_flags(strict: bool) -> i32 {
    let mut flags = qjs::JS_EVAL_TYPE_GLOBAL as i32;
    if strict {
        flags |= qjs::JS_EVAL_FLAG_STRICT as i32;
    }
    flags
}

fn eval_raw<'js>(
    ctx: &Ctx<'js>,
    name: &str,
    source: &str,
    flags: i32,
) -> rquickjs::Result<Value<'js>> {
    let name = CString::new(name)?;
    let length = source.len();
    let source = CString::new(source)?;
    // SAFETY: both strings are NUL-terminated and outlive the call, and
    // `length` excludes the terminator. `JS_Eval` returns an owned value
    // whose reference `Value::from_raw` takes over.
    let value = unsafe {
        let raw = qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            source.as_ptr(),
            length as _,
            name.as_ptr(),
            flags,
        );
        Value::from_raw(ctx.clone(), raw)
    };
    if value.is_exception() {
        return Err(rquickjs::Error::Exception);
    }
    Ok(value)
}

/// Source location of the nearest script frame calling into native code
fn caller_location(ctx: &Ctx<'_>) -> Option<String> {
    let constructor: Constructor<'_> = ctx.globals().get("Error").ok()?;
    let error: Object<'_> = constructor.construct(()).ok()?;
    let stack: String = error.get("stack").ok()?;
    stack.lines().find_map(frame_location)
}

/// Parse one stack line (`at fn (file:line:col)` or `at file:line:col`)
/// into its file part.
fn frame_location(line: &str) -> Option<String> {
    let frame = line.trim().strip_prefix("at ")?;
    let location = match frame.rfind(" (") {
        Some(open) if frame.ends_with(')') => &frame[open + 2..frame.len() - 1],
        _ => frame,
    };
    if location == "native" || location.starts_with('<') {
        return None;
    }
    if location.starts_with("eval_script") {
        return None;
    }
    let file = strip_position(location);
    (!file.is_empty()).then(|| file.to_string())
}

fn strip_position(location: &str) -> &str {
    let mut rest = location;
    for _ in 0..2 {
        match rest.rsplit_once(':') {
            Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => {
                rest = head;
            }
            _ => break,
        }
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_location_named() {
        assert_eq!(
            frame_location("    at load (file:///srv/app/a.js:3:17)"),
            Some("file:///srv/app/a.js".to_string())
        );
    }

    #[test]
    fn test_frame_location_anonymous() {
        assert_eq!(
            frame_location("    at file:///srv/app/b.js:12"),
            Some("file:///srv/app/b.js".to_string())
        );
    }

    #[test]
    fn test_frame_location_skips_native() {
        assert_eq!(frame_location("    at require (native)"), None);
        assert_eq!(frame_location("    at <eval> (<input>:1:1)"), None);
        assert_eq!(frame_location("not a frame"), None);
    }

    #[test]
    fn test_frame_location_skips_unnamed_eval() {
        assert_eq!(frame_location("    at f (eval_script:1:24)"), None);
        assert_eq!(frame_location("    at eval_script:2:1"), None);
    }

    #[test]
    fn test_scoped_keeps_lines() {
        let source = "let a = 1;\na + 2 // done";
        let wrapped = scoped(source);
        assert_eq!(wrapped.lines().count(), 3);
        assert!(wrapped.starts_with("{let a = 1;\n"));
        assert!(wrapped.ends_with("// done\n}"));
    }

    #[test]
    fn test_strip_position_keeps_scheme() {
        assert_eq!(strip_position("file:///a.js:1:2"), "file:///a.js");
        assert_eq!(strip_position("ski:cache"), "ski:cache");
        assert_eq!(strip_position("eval_script"), "eval_script");
    }
}
