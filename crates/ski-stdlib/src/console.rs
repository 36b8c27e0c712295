//! `console` global forwarding script output to `tracing`

use rquickjs::function::Rest;
use rquickjs::{Coerced, Ctx, Exception, FromJs, Function, Object, Value};
use ski_engine::{describe, to_json, HostContext, HostGlobal};
use tracing::{debug, error, info, warn};

/// Log target of every script line
pub const CONSOLE_TARGET: &str = "ski::console";

#[derive(Debug, Clone, Copy)]
enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

const METHODS: [(&str, Severity); 5] = [
    ("log", Severity::Info),
    ("info", Severity::Info),
    ("debug", Severity::Debug),
    ("warn", Severity::Warn),
    ("error", Severity::Error),
];

/// Installs `console.log` and friends
#[derive(Debug, Default)]
pub struct ConsoleGlobal;

impl HostGlobal for ConsoleGlobal {
    fn install<'js>(
        &self,
        ctx: &Ctx<'js>,
        globals: &Object<'js>,
        host: &HostContext,
    ) -> rquickjs::Result<()> {
        let console = Object::new(ctx.clone())?;
        for (name, severity) in METHODS {
            let vm = host.vm_id();
            console.set(
                name,
                Function::new(ctx.clone(), move |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
                    emit(severity, vm, &format_args(&ctx, args.0));
                })?,
            )?;
        }
        globals.set("console", console)
    }
}

fn emit(severity: Severity, vm: usize, line: &str) {
    match severity {
        Severity::Debug => debug!(target: CONSOLE_TARGET, vm, "{}", line),
        Severity::Info => info!(target: CONSOLE_TARGET, vm, "{}", line),
        Severity::Warn => warn!(target: CONSOLE_TARGET, vm, "{}", line),
        Severity::Error => error!(target: CONSOLE_TARGET, vm, "{}", line),
    }
}

/// Join arguments with spaces the way a browser console prints them
fn format_args<'js>(ctx: &Ctx<'js>, args: Vec<Value<'js>>) -> String {
    args.into_iter()
        .map(|value| format_value(ctx, value))
        .collect::<Vec<_>>()
        .join(" ")
}

fn format_value<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    if let Some(text) = value.as_string() {
        return text.to_string().unwrap_or_default();
    }
    if let Some(object) = value.as_object().filter(|_| !value.is_function()) {
        if Exception::from_object(object.clone()).is_some() {
            return describe(ctx, value);
        }
        if let Ok(json) = to_json(ctx, value.clone()) {
            return json.to_string();
        }
    }
    Coerced::<String>::from_js(ctx, value)
        .map(|text| text.0)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn formatted(source: &str) -> String {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let args: Vec<Value<'_>> = ctx.eval(source).unwrap();
            format_args(&ctx, args)
        })
    }

    #[test]
    fn test_format_scalars_and_strings() {
        assert_eq!(formatted("['a', 1, true, null, undefined]"), "a 1 true null undefined");
    }

    #[test]
    fn test_format_objects_as_json() {
        assert_eq!(formatted("[{ a: [1, 2] }]"), r#"{"a":[1,2]}"#);
    }

    #[test]
    fn test_format_errors_by_name() {
        assert!(formatted("[new TypeError('nope')]").starts_with("TypeError: nope"));
    }
}
