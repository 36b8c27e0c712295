//! Integration tests for the stdlib host modules running inside a VM

use parking_lot::Mutex;
use serde_json::json;
use ski_engine::host::{FetchError, Request, Response};
use ski_engine::{
    Cache, DefaultSourceReader, Fetch, LoaderOptions, ModuleLoader, ModuleRegistry, RunContext,
    Vm, VmError, VmOptions,
};
use ski_stdlib::Stdlib;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Answers every request with a JSON echo of what it received
#[derive(Default)]
struct EchoFetch {
    sent: Mutex<Vec<Request>>,
}

impl Fetch for EchoFetch {
    fn send(&self, request: Request) -> Result<Response, FetchError> {
        self.sent.lock().push(request.clone());
        if request.url.contains("fail.test") {
            return Err(FetchError::Transport("down".to_string()));
        }
        let echo = json!({
            "method": request.method,
            "url": request.url,
            "body": request.body.as_deref().map(String::from_utf8_lossy),
        });
        Ok(Response {
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("set-cookie".to_string(), "b=2".to_string()),
            ],
            body: echo.to_string().into_bytes(),
        })
    }
}

struct Harness {
    _dir: TempDir,
    stdlib: Stdlib,
    fetch: Arc<EchoFetch>,
    vm: Vm,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let fetch = Arc::new(EchoFetch::default());
    let stdlib = Stdlib::with_fetch(fetch.clone(), None).unwrap();
    let mut registry = ModuleRegistry::new();
    stdlib.register(&mut registry);
    let loader = ModuleLoader::new(
        LoaderOptions::with_dir(dir.path()).unwrap(),
        Arc::new(DefaultSourceReader::default()),
        registry,
    )
    .unwrap();
    let vm = Vm::new(1, &VmOptions::default(), Arc::new(loader)).unwrap();
    Harness {
        _dir: dir,
        stdlib,
        fetch,
        vm,
    }
}

fn run(h: &mut Harness, source: &str) -> Result<serde_json::Value, VmError> {
    h.vm.run_string(&RunContext::background(), source)
}

// ============================================================================
// ski:cache
// ============================================================================

#[test]
fn test_cache_get_set_del() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const cache = require('ski:cache');
        cache.set('obj', { x: 1 });
        cache.set('text', 'hi');
        cache.set('gone', 'soon');
        cache.del('gone');
        [cache.get('obj'), cache.get('text'), cache.get('gone'), cache.get('never')]
        "#,
    )
    .unwrap();
    assert_eq!(value, json!([r#"{"x":1}"#, "hi", null, null]));
    assert_eq!(h.stdlib.cache().get("text").unwrap(), b"hi");
}

#[test]
fn test_cache_bytes() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const cache = require('ski:cache');
        cache.setBytes('k', new Uint8Array([1, 2, 3]));
        Array.from(new Uint8Array(cache.getBytes('k')))
        "#,
    )
    .unwrap();
    assert_eq!(value, json!([1, 2, 3]));
}

#[test]
fn test_cache_ttl() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        (async () => {
            const cache = require('ski:cache');
            cache.set('short', 'v', 20);
            cache.set('long', 'v', '1h');
            await sleep(60);
            return [cache.get('short'), cache.get('long')];
        })()
        "#,
    )
    .unwrap();
    assert_eq!(value, json!([null, "v"]));
}

#[test]
fn test_cache_rejects_bad_ttl() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const cache = require('ski:cache');
        const names = [];
        try { cache.set('a', 'b', {}) } catch (e) { names.push(e.name) }
        try { cache.set('a', 'b', '3 weeks') } catch (e) { names.push(e.name) }
        names
        "#,
    )
    .unwrap();
    assert_eq!(value, json!(["TypeError", "TypeError"]));
}

// ============================================================================
// ski:http
// ============================================================================

#[test]
fn test_http_get_response_object() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        (async () => {
            const http = require('ski:http');
            const res = await http.get('http://api.test/items', { 'X-Id': 5 });
            const body = res.json();
            return [res.status, res.ok, res.statusText, res.headers['set-cookie'],
                    res.headers['content-type'], body.method, body.url];
        })()
        "#,
    )
    .unwrap();
    assert_eq!(
        value,
        json!([200, true, "OK", "a=1, b=2", "application/json", "GET", "http://api.test/items"])
    );
    let sent = h.fetch.sent.lock();
    assert_eq!(sent[0].header_value("x-id"), Some("5"));
}

#[test]
fn test_http_post_json_body() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        (async () => {
            const http = require('ski:http');
            const res = await http.post('http://api.test/items', { a: 1 });
            return res.json().body;
        })()
        "#,
    )
    .unwrap();
    assert_eq!(value, json!(r#"{"a":1}"#));
    let sent = h.fetch.sent.lock();
    assert_eq!(sent[0].method, "POST");
    assert_eq!(sent[0].header_value("content-type"), Some("application/json"));
}

#[test]
fn test_http_post_keeps_caller_content_type() {
    let mut h = harness();
    run(
        &mut h,
        r#"
        require('ski:http').post('http://api.test/', { a: 1 }, { 'content-type': 'text/x-json' })
            .then(() => null)
        "#,
    )
    .unwrap();
    let sent = h.fetch.sent.lock();
    let types: Vec<_> = sent[0]
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .collect();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].1, "text/x-json");
}

#[test]
fn test_http_post_search_params_as_form() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        (async () => {
            const http = require('ski:http');
            const res = await http.post('http://api.test/form', new URLSearchParams({ q: 'a b', n: 2 }));
            return res.json().body;
        })()
        "#,
    )
    .unwrap();
    assert_eq!(value, json!("q=a+b&n=2"));
    let sent = h.fetch.sent.lock();
    assert_eq!(
        sent[0].header_value("content-type"),
        Some("application/x-www-form-urlencoded")
    );
}

#[test]
fn test_http_request_and_bytes() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        (async () => {
            const http = require('ski:http');
            const res = await http.request('delete', 'http://api.test/x', 'payload');
            return new Uint8Array(res.bytes()).length === res.text().length;
        })()
        "#,
    )
    .unwrap();
    assert_eq!(value, json!(true));
    assert_eq!(h.fetch.sent.lock()[0].method, "DELETE");
}

#[test]
fn test_http_template() {
    let mut h = harness();
    run(
        &mut h,
        r#"
        require('ski:http')
            .template('PUT http://api.test/u/{{id}}\nX-Token: {{token}}\n\nhello {{name}}',
                      { id: 3, token: 'k', name: 'ada' })
            .then(() => null)
        "#,
    )
    .unwrap();
    let sent = h.fetch.sent.lock();
    assert_eq!(sent[0].method, "PUT");
    assert_eq!(sent[0].url, "http://api.test/u/3");
    assert_eq!(sent[0].header_value("x-token"), Some("k"));
    assert_eq!(sent[0].body.as_deref(), Some(&b"hello ada"[..]));
}

#[test]
fn test_http_template_error_throws() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        let message;
        try { require('ski:http').template('   ') } catch (e) { message = e.message }
        message
        "#,
    )
    .unwrap();
    assert_eq!(value, json!("missing request line"));
}

#[test]
fn test_http_failure_rejects() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"require('ski:http').get('http://fail.test/').catch(e => e.message)"#,
    )
    .unwrap();
    assert_eq!(value, json!("request failed: down"));
}

#[test]
fn test_set_proxy_needs_proxy_table() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        let message;
        try { require('ski:http').setProxy('api.test', 'http://p:8080') } catch (e) { message = e.message }
        message
        "#,
    )
    .unwrap();
    assert!(value.as_str().unwrap().contains("proxies are not supported"));
}

// ============================================================================
// ski:shortener and URLSearchParams
// ============================================================================

#[test]
fn test_shortener_round_trip() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const s = require('ski:shortener');
        const tpl = `POST http://localhost
Content-Type: application/json

{"key":"foo"}`;
        const id = s.set(tpl);
        const same = s.set(tpl) === id;
        const found = s.get(id) === tpl;
        s.del(id);
        [same, found, s.get(id), s.get('unknown')]
        "#,
    )
    .unwrap();
    assert_eq!(value, json!([true, true, null, null]));
}

#[test]
fn test_shortener_shares_the_cache() {
    let mut h = harness();
    let id = run(&mut h, "require('ski:shortener').set('GET http://a.test')").unwrap();
    let key = format!("shortener:{}", id.as_str().unwrap());
    assert_eq!(h.stdlib.cache().get(&key).unwrap(), b"GET http://a.test");
}

#[test]
fn test_url_search_params() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const p = new URLSearchParams('?a=1&b=2');
        p.append('a', 3);
        p.set('b', 'x y');
        p.delete('missing');
        const seen = [];
        p.forEach((v, k) => seen.push(k + '=' + v));
        [p.toString(), p.get('a'), p.getAll('a'), p.has('b'), p.has('c'), p.keys(),
         p.values(), p.entries(), seen, p instanceof URLSearchParams]
        "#,
    )
    .unwrap();
    assert_eq!(
        value,
        json!([
            "a=1&b=x+y&a=3",
            "1",
            ["1", "3"],
            true,
            false,
            ["a", "b", "a"],
            ["1", "x y", "3"],
            [["a", "1"], ["b", "x y"], ["a", "3"]],
            ["a=1", "b=x y", "a=3"],
            true
        ])
    );
}

#[test]
fn test_url_search_params_initializers() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const fromObject = new URLSearchParams({ q: ['r', 's'], n: 1 });
        const fromPairs = new URLSearchParams([['k', 'v'], ['k', 'w']]);
        const copy = new URLSearchParams(fromObject);
        copy.set('q', 'only');
        const sorted = new URLSearchParams('z=1&a=2&m=3');
        sorted.sort();
        let bad;
        try { new URLSearchParams([['lonely']]) } catch (e) { bad = e.name }
        [String(fromObject), `${fromPairs}`, copy.toString(), sorted.toString(),
         new URLSearchParams().toString(), bad]
        "#,
    )
    .unwrap();
    assert_eq!(
        value,
        json!(["q=r&q=s&n=1", "k=v&k=w", "q=only&n=1", "a=2&m=3&z=1", "", "TypeError"])
    );
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn test_timers_fire_in_order_with_args() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        (async () => {
            const out = [];
            setTimeout(() => out.push('late'), 40);
            setTimeout((x, y) => out.push(x + y), 10, 'ea', 'rly');
            await sleep(80);
            return out;
        })()
        "#,
    )
    .unwrap();
    assert_eq!(value, json!(["early", "late"]));
}

#[test]
fn test_run_waits_for_pending_timers() {
    let mut h = harness();
    let value = run(
        &mut h,
        "globalThis.fired = []; setTimeout(() => fired.push(1), 20); 'started'",
    )
    .unwrap();
    assert_eq!(value, json!("started"));
    assert_eq!(run(&mut h, "fired").unwrap(), json!([1]));
}

#[test]
fn test_clear_timeout() {
    let mut h = harness();
    let started = Instant::now();
    let value = run(
        &mut h,
        r#"
        globalThis.hits = 0;
        const id = setTimeout(() => hits++, 5000);
        clearTimeout(id);
        new Promise(resolve => setTimeout(resolve, 20)).then(() => hits)
        "#,
    )
    .unwrap();
    assert_eq!(value, json!(0));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.stdlib.timers().pending(), 0);
}

#[test]
fn test_timer_capped_at_deadline() {
    let mut h = harness();
    let ctx = RunContext::background().with_timeout(Duration::from_millis(100));
    let started = Instant::now();
    let result = h
        .vm
        .run_string(&ctx, "globalThis.late = false; setTimeout(() => { late = true }, 10000); 1");
    assert!(matches!(result, Err(VmError::DeadlineExceeded)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(run(&mut h, "late").unwrap(), json!(false));
}

#[test]
fn test_timer_callback_error_fails_run() {
    let mut h = harness();
    let err = run(
        &mut h,
        "setTimeout(() => { throw new Error('late failure') }, 5); 1",
    )
    .unwrap_err();
    assert!(err.to_string().contains("late failure"));
}

#[test]
fn test_cancel_does_not_wait_for_pending_timers() {
    let mut h = harness();
    let context = RunContext::background();
    let canceller = context.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });
    let started = Instant::now();
    let result = h
        .vm
        .run_string(&context, "setTimeout(() => {}, 3000); while (true) {}");
    assert!(matches!(result, Err(VmError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(h.stdlib.timers().pending(), 0);
}

#[test]
fn test_interrupt_ends_a_sleeping_run() {
    let mut h = harness();
    let interrupt = h.vm.interrupt_handle();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        interrupt.interrupt();
    });
    let started = Instant::now();
    let result = run(&mut h, "(async () => { await sleep(3000); return 1 })()");
    assert!(matches!(result, Err(VmError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(run(&mut h, "1 + 1").unwrap(), json!(2));
}

#[test]
fn test_clear_timeout_only_reaches_own_run() {
    let mut h = harness();
    let mut other = Vm::new(2, &VmOptions::default(), h.vm.modules().clone()).unwrap();
    let victim = &mut h.vm;
    let fired = thread::scope(|scope| {
        let waiting = scope.spawn(move || {
            victim.run_string(
                &RunContext::background(),
                r#"
                (async () => {
                    let fired = false;
                    setTimeout(() => { fired = true }, 300);
                    await sleep(400);
                    return fired;
                })()
                "#,
            )
        });
        thread::sleep(Duration::from_millis(50));
        other
            .run_string(
                &RunContext::background(),
                "for (let i = 1; i < 1000; i++) clearTimeout(i); 'cleared'",
            )
            .unwrap();
        waiting.join().unwrap()
    });
    assert_eq!(fired.unwrap(), json!(true));
}

#[test]
fn test_out_of_range_delays() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const ids = [1e23, Number.MAX_VALUE, Infinity, -1, NaN].map(ms => setTimeout(() => {}, ms));
        clearTimeout(ids[0]);
        clearTimeout(ids[1]);
        require('ski:cache').set('k', 'v', 1e300);
        [ids.length, require('ski:cache').get('k')]
        "#,
    )
    .unwrap();
    assert_eq!(value, json!([5, "v"]));
}

// ============================================================================
// console and parser:regex
// ============================================================================

#[test]
fn test_console_methods_exist() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        console.log('hello', { a: 1 });
        console.info(1, 2);
        console.debug();
        console.warn([1]);
        console.error(new Error('shown'));
        ['log', 'info', 'debug', 'warn', 'error'].every(m => typeof console[m] === 'function')
        "#,
    )
    .unwrap();
    assert_eq!(value, json!(true));
}

#[test]
fn test_regex_parser_module() {
    let mut h = harness();
    let value = run(
        &mut h,
        r#"
        const p = require('parser:regex');
        let invalid;
        try { p.getString('x', '(') } catch (e) { invalid = e.message.startsWith('invalid selector') }
        [p.getString('id=42;', 'id=(\\d+)'), p.getStrings('a1 b2', '[a-z](\\d)'),
         p.getElement('a1 b2', '[a-z]\\d'), p.getElements('a1 b2', '[a-z]\\d'), invalid]
        "#,
    )
    .unwrap();
    assert_eq!(value, json!(["42", ["1", "2"], "a1", ["a1", "b2"], true]));
}
