//! Engine module hooks backed by the shared [`ModuleLoader`](crate::module::ModuleLoader)
//!
//! `import` statements go through the same resolution and cache as
//! `require`. Only ES modules are handed to the engine as-is; every other
//! record kind is presented as a small ES module whose default export is
//! the CommonJS-style instance.

use super::bindings::{instantiate, RESOLVED_REQUIRE};
use super::shared::VmShared;
use crate::module::ModuleKind;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Module};
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct ModuleHooks {
    shared: Arc<VmShared>,
}

impl ModuleHooks {
    pub(crate) fn new(shared: Arc<VmShared>) -> Self {
        Self { shared }
    }
}

impl Resolver for ModuleHooks {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let referrer = (!base.is_empty()).then_some(base);
        self.shared
            .modules
            .resolve(referrer, name)
            .map(|record| record.id().to_string())
            .map_err(|err| rquickjs::Error::new_resolving_message(base, name, err.to_string()))
    }
}

impl Loader for ModuleHooks {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let record = self
            .shared
            .modules
            .cached(name)
            .ok_or_else(|| rquickjs::Error::new_loading_message(name, "module was not resolved"))?;

        let id = serde_json::Value::from(name).to_string();
        let source = match record.kind() {
            ModuleKind::EsModule(source) => source.to_string(),
            ModuleKind::CommonJs(_) | ModuleKind::Json(_) => {
                format!("export default globalThis.{}({});\n", RESOLVED_REQUIRE, id)
            }
            ModuleKind::Native(_) | ModuleKind::Parser(_) => {
                let exports = instantiate(ctx, &self.shared, &record)?;
                let mut source = format!(
                    "const __ski_exports = globalThis.{}({});\nexport default __ski_exports;\n",
                    RESOLVED_REQUIRE, id
                );
                if let Some(object) = exports.as_object() {
                    for key in object.keys::<String>() {
                        let key = key?;
                        if is_identifier(&key) {
                            source.push_str(&format!(
                                "export const {0} = __ski_exports.{0};\n",
                                key
                            ));
                        }
                    }
                }
                source
            }
        };
        Module::declare(ctx.clone(), name, source)
    }
}

const RESERVED: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "import", "in", "instanceof", "let", "new", "null", "return", "static", "super",
    "switch", "this", "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Whether `name` can be used as an exported binding name
fn is_identifier(name: &str) -> bool {
    if RESERVED.contains(&name) {
        return false;
    }
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("getBytes"));
        assert!(is_identifier("_private"));
        assert!(is_identifier("$"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("with-dash"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("delete"));
        assert!(!is_identifier("default"));
    }
}
