//! `ski:http` host module
//!
//! Every request runs on a worker thread and settles a promise through the
//! run's event loop, so scripts `await` responses without blocking the VM.

use crate::cache::bytes_of;
use crate::fetch::ProxyTable;
use crate::search_params::form_body;
use crate::template::request_from_template;
use rquickjs::function::{Opt, Rest};
use rquickjs::{ArrayBuffer, Coerced, Ctx, Exception, Function, Object, Promise, Value};
use ski_engine::host::{Request, Response};
use ski_engine::{to_json, Fetch, HostContext, HostModule};
use std::sync::Arc;

/// `require("ski:http")`
pub struct HttpModule {
    fetch: Arc<dyn Fetch>,
    proxies: Option<Arc<ProxyTable>>,
}

impl HttpModule {
    /// Expose `fetch` to scripts. `setProxy` needs the client's proxy table.
    pub fn new(fetch: Arc<dyn Fetch>, proxies: Option<Arc<ProxyTable>>) -> Self {
        Self { fetch, proxies }
    }
}

impl HostModule for HttpModule {
    fn instantiate<'js>(&self, ctx: &Ctx<'js>, host: &HostContext) -> rquickjs::Result<Value<'js>> {
        let exports = Object::new(ctx.clone())?;

        let (fetch, h) = (self.fetch.clone(), host.clone());
        exports.set(
            "get",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, url: String, headers: Opt<Value<'js>>| {
                    let request = with_headers(&ctx, Request::get(url), headers.0)?;
                    send(&ctx, &h, &fetch, request)
                },
            )?,
        )?;

        let (fetch, h) = (self.fetch.clone(), host.clone());
        exports.set(
            "head",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, url: String, headers: Opt<Value<'js>>| {
                    let request = with_headers(&ctx, Request::new("HEAD", url), headers.0)?;
                    send(&ctx, &h, &fetch, request)
                },
            )?,
        )?;

        let (fetch, h) = (self.fetch.clone(), host.clone());
        exports.set(
            "post",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, url: String, body: Opt<Value<'js>>, headers: Opt<Value<'js>>| {
                    let request = with_headers(&ctx, Request::new("POST", url), headers.0)?;
                    let request = with_body(&ctx, request, body.0)?;
                    send(&ctx, &h, &fetch, request)
                },
            )?,
        )?;

        let (fetch, h) = (self.fetch.clone(), host.clone());
        exports.set(
            "request",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      method: String,
                      url: String,
                      body: Opt<Value<'js>>,
                      headers: Opt<Value<'js>>| {
                    let request = with_headers(&ctx, Request::new(method, url), headers.0)?;
                    let request = with_body(&ctx, request, body.0)?;
                    send(&ctx, &h, &fetch, request)
                },
            )?,
        )?;

        let (fetch, h) = (self.fetch.clone(), host.clone());
        exports.set(
            "template",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, text: String, args: Opt<Value<'js>>| {
                    let args = match args.0 {
                        Some(args) => to_json(&ctx, args).map_err(|err| err.throw(&ctx))?,
                        None => serde_json::Value::Null,
                    };
                    let request = request_from_template(&text, &args)
                        .map_err(|err| Exception::throw_message(&ctx, &err.to_string()))?;
                    send(&ctx, &h, &fetch, request)
                },
            )?,
        )?;

        let proxies = self.proxies.clone();
        exports.set(
            "setProxy",
            Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>, target: String, list: Rest<String>| {
                    let Some(proxies) = &proxies else {
                        return Err(Exception::throw_message(
                            &ctx,
                            "proxies are not supported by this http client",
                        ));
                    };
                    proxies
                        .set(&target, list.0)
                        .map_err(|err| Exception::throw_message(&ctx, &err.to_string()))
                },
            )?,
        )?;

        Ok(exports.into_value())
    }
}

fn send<'js>(
    ctx: &Ctx<'js>,
    host: &HostContext,
    fetch: &Arc<dyn Fetch>,
    request: Request,
) -> rquickjs::Result<Promise<'js>> {
    let fetch = fetch.clone();
    host.spawn_promise(
        ctx,
        move |_run| fetch.send(request).map_err(|err| err.to_string()),
        |ctx, response| response_object(ctx, response),
    )
}

fn with_headers<'js>(
    ctx: &Ctx<'js>,
    mut request: Request,
    headers: Option<Value<'js>>,
) -> rquickjs::Result<Request> {
    let Some(headers) = headers.filter(|value| !value.is_undefined() && !value.is_null()) else {
        return Ok(request);
    };
    let headers = headers
        .into_object()
        .ok_or_else(|| Exception::throw_type(ctx, "headers must be an object"))?;
    for entry in headers.props::<String, Coerced<String>>() {
        let (name, value) = entry?;
        request = request.header(name, value.0);
    }
    Ok(request)
}

/// Strings and byte buffers are sent as is, `URLSearchParams` form-encoded,
/// other values as JSON
fn with_body<'js>(
    ctx: &Ctx<'js>,
    request: Request,
    body: Option<Value<'js>>,
) -> rquickjs::Result<Request> {
    let Some(body) = body.filter(|value| !value.is_undefined() && !value.is_null()) else {
        return Ok(request);
    };
    if let Some(text) = body.as_string() {
        return Ok(request.body(text.to_string()?));
    }
    if let Some(bytes) = bytes_of(ctx, &body)? {
        return Ok(request.body(bytes));
    }
    if let Some(form) = form_body(&body)? {
        let request = if request.header_value("content-type").is_none() {
            request.header("Content-Type", "application/x-www-form-urlencoded")
        } else {
            request
        };
        return Ok(request.body(form));
    }
    let json = to_json(ctx, body).map_err(|err| err.throw(ctx))?;
    let request = if request.header_value("content-type").is_none() {
        request.header("Content-Type", "application/json")
    } else {
        request
    };
    Ok(request.body(json.to_string()))
}

fn response_object<'js>(ctx: &Ctx<'js>, response: Response) -> rquickjs::Result<Value<'js>> {
    let object = Object::new(ctx.clone())?;
    object.set("status", i32::from(response.status))?;
    object.set("statusText", response.status_text.as_str())?;
    object.set("ok", response.ok())?;

    let headers = Object::new(ctx.clone())?;
    for (name, value) in &response.headers {
        let name = name.to_ascii_lowercase();
        let joined = match headers.get::<_, Option<String>>(name.as_str())? {
            Some(existing) => format!("{}, {}", existing, value),
            None => value.clone(),
        };
        headers.set(name, joined)?;
    }
    object.set("headers", headers)?;

    let body: Arc<[u8]> = response.body.into();

    let text = body.clone();
    object.set(
        "text",
        Function::new(ctx.clone(), move || {
            String::from_utf8_lossy(&text).into_owned()
        })?,
    )?;

    let json = body.clone();
    object.set(
        "json",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| -> rquickjs::Result<Value<'js>> {
            ctx.json_parse(String::from_utf8_lossy(&json).into_owned())
        })?,
    )?;

    object.set(
        "bytes",
        Function::new(ctx.clone(), move |ctx: Ctx<'js>| {
            ArrayBuffer::new(ctx, body.to_vec())
        })?,
    )?;

    Ok(object.into_value())
}
