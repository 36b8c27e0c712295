//! `URLSearchParams` global
//!
//! Query-string builder backed by `url::form_urlencoded`. Pairs keep their
//! insertion order. An instance passed as an `ski:http` request body is
//! sent as `application/x-www-form-urlencoded`.

use parking_lot::Mutex;
use rquickjs::function::{Opt, This};
use rquickjs::object::Property;
use rquickjs::{Array, Coerced, Ctx, Exception, FromJs, Function, Object, Value};
use ski_engine::{HostContext, HostGlobal};
use std::sync::Arc;
use url::form_urlencoded;

/// Hidden property marking an object as a `URLSearchParams` instance
const MARKER: &str = "__ski_search_params";

/// Gives instances the constructor's prototype so `instanceof` holds
const CONSTRUCTOR: &str = r#"(function (make) {
  return function URLSearchParams(init) {
    return Object.setPrototypeOf(make(init), URLSearchParams.prototype);
  };
})"#;

type Pairs = Arc<Mutex<Vec<(String, String)>>>;

/// Installs the `URLSearchParams` constructor
#[derive(Debug, Default)]
pub struct SearchParamsGlobal;

impl HostGlobal for SearchParamsGlobal {
    fn install<'js>(
        &self,
        ctx: &Ctx<'js>,
        globals: &Object<'js>,
        _host: &HostContext,
    ) -> rquickjs::Result<()> {
        let make = Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, init: Opt<Value<'js>>| -> rquickjs::Result<Object<'js>> {
                let pairs = initial_pairs(&ctx, init.0)?;
                instance(&ctx, Arc::new(Mutex::new(pairs)))
            },
        )?;
        let wrap: Function<'js> = ctx.eval(CONSTRUCTOR)?;
        let constructor: Function<'js> = wrap.call((make,))?;
        globals.set("URLSearchParams", constructor)
    }
}

/// Encoded text of `value` when it is a `URLSearchParams` instance
pub(crate) fn form_body<'js>(value: &Value<'js>) -> rquickjs::Result<Option<String>> {
    let Some(object) = value.as_object() else {
        return Ok(None);
    };
    if !object.contains_key(MARKER)? {
        return Ok(None);
    }
    let to_string: Function<'js> = object.get("toString")?;
    to_string.call((This(object.clone()),)).map(Some)
}

fn initial_pairs<'js>(
    ctx: &Ctx<'js>,
    init: Option<Value<'js>>,
) -> rquickjs::Result<Vec<(String, String)>> {
    let Some(init) = init.filter(|value| !value.is_undefined() && !value.is_null()) else {
        return Ok(Vec::new());
    };
    if let Some(text) = init.as_string() {
        return Ok(parse(&text.to_string()?));
    }
    if let Some(text) = form_body(&init)? {
        return Ok(parse(&text));
    }
    if let Some(list) = init.as_array() {
        let mut pairs = Vec::with_capacity(list.len());
        for entry in list.iter::<Array<'js>>() {
            let entry = entry?;
            if entry.len() != 2 {
                return Err(Exception::throw_type(
                    ctx,
                    "URLSearchParams entries must be [name, value] pairs",
                ));
            }
            let name: Coerced<String> = entry.get(0)?;
            let value: Coerced<String> = entry.get(1)?;
            pairs.push((name.0, value.0));
        }
        return Ok(pairs);
    }
    let Some(object) = init.as_object() else {
        return Err(Exception::throw_type(
            ctx,
            "URLSearchParams expects a string, an object or a list of pairs",
        ));
    };
    let mut pairs = Vec::new();
    for prop in object.props::<String, Value<'js>>() {
        let (name, value) = prop?;
        match value.as_array() {
            Some(values) => {
                for value in values.iter::<Coerced<String>>() {
                    pairs.push((name.clone(), value?.0));
                }
            }
            None => pairs.push((name, Coerced::<String>::from_js(ctx, value)?.0)),
        }
    }
    Ok(pairs)
}

fn parse(query: &str) -> Vec<(String, String)> {
    let query = query.strip_prefix('?').unwrap_or(query);
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn encode(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

fn instance<'js>(ctx: &Ctx<'js>, pairs: Pairs) -> rquickjs::Result<Object<'js>> {
    let object = Object::new(ctx.clone())?;
    object.prop(MARKER, Property::from(true))?;

    let p = pairs.clone();
    object.set(
        "append",
        Function::new(
            ctx.clone(),
            move |name: Coerced<String>, value: Coerced<String>| {
                p.lock().push((name.0, value.0));
            },
        )?,
    )?;

    let p = pairs.clone();
    object.set(
        "delete",
        Function::new(ctx.clone(), move |name: Coerced<String>| {
            p.lock().retain(|(key, _)| *key != name.0);
        })?,
    )?;

    let p = pairs.clone();
    object.set(
        "get",
        Function::new(ctx.clone(), move |name: Coerced<String>| {
            p.lock()
                .iter()
                .find(|(key, _)| *key == name.0)
                .map(|(_, value)| value.clone())
        })?,
    )?;

    let p = pairs.clone();
    object.set(
        "getAll",
        Function::new(ctx.clone(), move |name: Coerced<String>| {
            p.lock()
                .iter()
                .filter(|(key, _)| *key == name.0)
                .map(|(_, value)| value.clone())
                .collect::<Vec<_>>()
        })?,
    )?;

    let p = pairs.clone();
    object.set(
        "has",
        Function::new(ctx.clone(), move |name: Coerced<String>| {
            p.lock().iter().any(|(key, _)| *key == name.0)
        })?,
    )?;

    // Replaces the first pair named `name` and drops the others.
    let p = pairs.clone();
    object.set(
        "set",
        Function::new(
            ctx.clone(),
            move |name: Coerced<String>, value: Coerced<String>| {
                let mut pairs = p.lock();
                match pairs.iter().position(|(key, _)| *key == name.0) {
                    Some(first) => {
                        pairs[first].1 = value.0;
                        let mut index = 0;
                        pairs.retain(|(key, _)| {
                            index += 1;
                            index - 1 == first || *key != name.0
                        });
                    }
                    None => pairs.push((name.0, value.0)),
                }
            },
        )?,
    )?;

    let p = pairs.clone();
    object.set(
        "sort",
        Function::new(ctx.clone(), move || {
            p.lock().sort_by(|(a, _), (b, _)| a.cmp(b));
        })?,
    )?;

    let p = pairs.clone();
    object.set(
        "keys",
        Function::new(ctx.clone(), move || {
            p.lock().iter().map(|(key, _)| key.clone()).collect::<Vec<_>>()
        })?,
    )?;

    let p = pairs.clone();
    object.set(
        "values",
        Function::new(ctx.clone(), move || {
            p.lock()
                .iter()
                .map(|(_, value)| value.clone())
                .collect::<Vec<_>>()
        })?,
    )?;

    let p = pairs.clone();
    object.set(
        "entries",
        Function::new(ctx.clone(), move || {
            p.lock()
                .iter()
                .map(|(key, value)| vec![key.clone(), value.clone()])
                .collect::<Vec<_>>()
        })?,
    )?;

    // The callback may mutate the params, so it walks a snapshot.
    let p = pairs.clone();
    object.set(
        "forEach",
        Function::new(
            ctx.clone(),
            move |this: This<Object<'js>>, callback: Function<'js>| -> rquickjs::Result<()> {
                let snapshot = p.lock().clone();
                for (key, value) in snapshot {
                    callback.call::<_, ()>((value, key, this.0.clone()))?;
                }
                Ok(())
            },
        )?,
    )?;

    let p = pairs.clone();
    object.set(
        "toString",
        Function::new(ctx.clone(), move || encode(&p.lock()))?,
    )?;

    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_question_mark() {
        assert_eq!(
            parse("?a=1&b=two%20words&a=3"),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two words".to_string()),
                ("a".to_string(), "3".to_string()),
            ]
        );
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_encode_keeps_order() {
        let pairs = vec![
            ("q".to_string(), "rust lang".to_string()),
            ("page".to_string(), "2".to_string()),
            ("q".to_string(), "a&b".to_string()),
        ];
        assert_eq!(encode(&pairs), "q=rust+lang&page=2&q=a%26b");
    }
}
