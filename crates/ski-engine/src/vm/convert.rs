//! JSON <-> script value conversion

use super::{VmError, VmResult};
use rquickjs::{Ctx, Value};

/// Convert a script value to JSON through the engine's `JSON.stringify`.
///
/// Values with no JSON form (undefined, functions, symbols) become `null`.
pub fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> VmResult<serde_json::Value> {
    if value.is_undefined() || value.is_function() || value.is_symbol() {
        return Ok(serde_json::Value::Null);
    }
    let text = ctx
        .json_stringify(value)
        .and_then(|text| text.map(|text| text.to_string()).transpose())
        .map_err(|err| VmError::from_js(ctx, err))?;
    match text {
        Some(text) => serde_json::from_str(&text)
            .map_err(|err| VmError::Engine(format!("invalid JSON from script: {}", err))),
        None => Ok(serde_json::Value::Null),
    }
}

/// Convert JSON into a script value through the engine's `JSON.parse`
pub fn from_json<'js>(
    ctx: &Ctx<'js>,
    value: &serde_json::Value,
) -> rquickjs::Result<Value<'js>> {
    ctx.json_parse(value.to_string())
}
