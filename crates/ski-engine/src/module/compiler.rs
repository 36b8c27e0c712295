//! Syntax checking on a private engine instance
//!
//! The loader validates every module once, when it enters the cache, on a
//! runtime that never runs user code. Scripts and CommonJS envelopes are
//! compiled without being run. ES modules are declared on a throwaway
//! context whose loader answers every import with an empty module: the
//! engine loads a module's imports while compiling it, and dropping the
//! context frees everything the check declared.

use crate::vm::bindings::{compile_script, scoped};
use crate::vm::VmError;
use parking_lot::Mutex;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Context, Ctx, Module, Runtime};

struct Engine {
    // The context must drop before the runtime.
    context: Context,
    runtime: Runtime,
}

/// Compile-only engine shared by a loader
pub struct Compiler {
    engine: Mutex<Engine>,
}

impl Compiler {
    /// Create a compiler with its own engine runtime
    pub fn new() -> Result<Self, VmError> {
        let runtime = Runtime::new().map_err(|err| VmError::Engine(err.to_string()))?;
        runtime.set_loader(EmptyImports, EmptyImports);
        let context = Context::full(&runtime).map_err(|err| VmError::Engine(err.to_string()))?;
        Ok(Self {
            engine: Mutex::new(Engine { context, runtime }),
        })
    }

    /// Check that `source` parses as a classic script, scoped the way a
    /// VM runs it
    pub fn check_script(&self, name: &str, source: &str, strict: bool) -> Result<(), VmError> {
        let engine = self.engine.lock();
        engine.context.with(|ctx| {
            compile_script(&ctx, name, &scoped(source), strict)
                .map_err(|err| syntax_error(name, VmError::from_compile(&ctx, err)))
        })
    }

    /// Check that `source` parses as an ES module
    pub fn check_module(&self, name: &str, source: &str) -> Result<(), VmError> {
        let engine = self.engine.lock();
        let scratch =
            Context::full(&engine.runtime).map_err(|err| VmError::Engine(err.to_string()))?;
        scratch.with(|ctx| {
            Module::declare(ctx.clone(), name, source)
                .map(drop)
                .map_err(|err| syntax_error(name, VmError::from_compile(&ctx, err)))
        })
    }

    /// Check an already wrapped CommonJS envelope
    pub(crate) fn check_envelope(&self, name: &str, envelope: &str) -> Result<(), VmError> {
        let engine = self.engine.lock();
        engine.context.with(|ctx| {
            compile_script(&ctx, name, envelope, false)
                .map_err(|err| syntax_error(name, VmError::from_compile(&ctx, err)))
        })
    }
}

/// Resolves every import to itself and loads it as an empty module
struct EmptyImports;

impl Resolver for EmptyImports {
    fn resolve(&mut self, _ctx: &Ctx<'_>, _base: &str, name: &str) -> rquickjs::Result<String> {
        Ok(name.to_string())
    }
}

impl Loader for EmptyImports {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        Module::declare(ctx.clone(), name, "")
    }
}

fn syntax_error(name: &str, err: VmError) -> VmError {
    match err {
        VmError::Syntax(text) => VmError::Syntax(format!("{} ({})", text.trim_end(), name)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_script() {
        let compiler = Compiler::new().unwrap();
        assert!(compiler.check_script("a.js", "let a = 1; a + 2", false).is_ok());
    }

    #[test]
    fn test_script_is_not_executed() {
        let compiler = Compiler::new().unwrap();
        assert!(compiler
            .check_script("boom.js", "throw new Error('ran')", false)
            .is_ok());
    }

    #[test]
    fn test_invalid_script() {
        let compiler = Compiler::new().unwrap();
        let err = compiler.check_script("bad.js", "let = ;", false).unwrap_err();
        assert!(matches!(err, VmError::Syntax(_)));
        assert!(err.to_string().starts_with("SyntaxError"));
        assert!(err.to_string().contains("bad.js"));
    }

    #[test]
    fn test_top_level_return_is_rejected() {
        let compiler = Compiler::new().unwrap();
        assert!(matches!(
            compiler.check_script("ret.js", "return 1", false),
            Err(VmError::Syntax(_))
        ));
    }

    #[test]
    fn test_module_checks() {
        let compiler = Compiler::new().unwrap();
        assert!(compiler
            .check_module("m.mjs", "import x from './x.js'; export default x;")
            .is_ok());
        assert!(compiler
            .check_module("n.mjs", "import { a, b } from './x.js'; export const c = a + b;")
            .is_ok());
        assert!(matches!(
            compiler.check_module("bad.mjs", "export default ;"),
            Err(VmError::Syntax(_))
        ));
    }

    #[test]
    fn test_repeated_module_checks() {
        let compiler = Compiler::new().unwrap();
        for _ in 0..3 {
            assert!(compiler
                .check_module("same.mjs", "export const value = 1;")
                .is_ok());
        }
    }
}
