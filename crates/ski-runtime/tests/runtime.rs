//! Integration tests for the runtime facade

use rquickjs::{Ctx, Object, Value};
use serde_json::json;
use ski_engine::{Cache, HostContext, HostModule, RunContext, VmError};
use ski_runtime::{Config, Runtime, RuntimeError};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn write(root: &Path, path: &str, contents: &str) {
    let path = root.join(path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn runtime_in(dir: &Path) -> Runtime {
    let mut config = Config::default();
    config.js.base = Some(dir.to_path_buf());
    config.js.max_vms = 2;
    Runtime::new(config).unwrap()
}

fn background() -> RunContext {
    RunContext::background()
}

// ============================================================================
// Scripts and files
// ============================================================================

#[test]
fn test_run_string() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime_in(dir.path());
    assert_eq!(runtime.run_string(&background(), "1 + 2").unwrap(), json!(3));
    assert_eq!(
        runtime
            .run_string(&background(), "Promise.resolve([1, 2]).then(v => v.length)")
            .unwrap(),
        json!(2)
    );
}

#[test]
fn test_run_file_resolves_relative_to_file() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "app/lib/util.js", "exports.double = n => n * 2;");
    write(dir.path(), "app/main.js", "require('./lib/util').double(21)");
    let runtime = runtime_in(dir.path());

    let value = runtime
        .run_file(&background(), &dir.path().join("app/main.js"))
        .unwrap();
    assert_eq!(value, json!(42));
}

#[test]
fn test_run_mjs_file_as_module() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "job.mjs",
        "import * as cache from 'ski:cache';\ncache.set('ran', 'yes');\n",
    );
    let runtime = runtime_in(dir.path());

    runtime
        .run_file(&background(), &dir.path().join("job.mjs"))
        .unwrap();
    assert_eq!(runtime.stdlib().cache().get("ran").unwrap(), b"yes");
}

#[test]
fn test_run_file_export_with_args() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "sum.js", "module.exports = (a, b) => a + b;");
    let runtime = runtime_in(dir.path());

    let value = runtime
        .run_file_export(&background(), &dir.path().join("sum.js"), &[json!(2), json!(3)])
        .unwrap();
    assert_eq!(value, json!(5));
}

#[test]
fn test_run_module_from_configured_base() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "greet.mjs",
        "export default async (name) => `hello ${name}`;",
    );
    let runtime = runtime_in(dir.path());

    let value = runtime
        .run_module(&background(), "./greet.mjs", &[json!("ada")])
        .unwrap();
    assert_eq!(value, json!("hello ada"));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime_in(dir.path());
    let err = runtime
        .run_file(&background(), &dir.path().join("nope.js"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Io(_)));
}

#[test]
fn test_syntax_error_is_reported() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "broken.js", "let = ;");
    let runtime = runtime_in(dir.path());
    let err = runtime
        .run_file(&background(), &dir.path().join("broken.js"))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Vm(VmError::Syntax(_))));
}

#[test]
fn test_timeout_ends_run() {
    let dir = TempDir::new().unwrap();
    let runtime = runtime_in(dir.path());
    let ctx = background().with_timeout(Duration::from_millis(100));
    let err = runtime.run_string(&ctx, "while (true) {}").unwrap_err();
    assert!(matches!(err, RuntimeError::Vm(VmError::DeadlineExceeded)));
    assert_eq!(runtime.run_string(&background(), "'alive'").unwrap(), json!("alive"));
}

// ============================================================================
// Wiring
// ============================================================================

struct Version;

impl HostModule for Version {
    fn instantiate<'js>(&self, ctx: &Ctx<'js>, _host: &HostContext) -> rquickjs::Result<Value<'js>> {
        let exports = Object::new(ctx.clone())?;
        exports.set("version", "1.0")?;
        Ok(exports.into_value())
    }
}

#[test]
fn test_extra_modules_and_stdlib_are_registered() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.js.base = Some(dir.path().to_path_buf());
    let runtime = Runtime::with_modules(config, |registry| {
        registry.register_module("version", Version);
    })
    .unwrap();

    let value = runtime
        .run_string(
            &background(),
            "[require('ski:version').version, typeof require('ski:http').get, typeof setTimeout]",
        )
        .unwrap();
    assert_eq!(value, json!(["1.0", "function", "function"]));
}

#[test]
fn test_pool_follows_config() {
    let dir = TempDir::new().unwrap();
    let config = Config::parse(&format!(
        "[js]\ninitial_vms = 1\nmax_vms = 3\nbase = {:?}\n",
        dir.path().display().to_string()
    ))
    .unwrap();
    let runtime = Runtime::new(config).unwrap();
    let stats = runtime.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.max_vms, 3);
}
