//! Registry of host-provided modules, globals and parsers

use crate::host::{HostGlobal, HostModule, Parser};
use crate::{NATIVE_PREFIX, PARSER_PREFIX};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Host modules, global bindings and parsers available to every VM
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: FxHashMap<String, Arc<dyn HostModule>>,
    parsers: FxHashMap<String, Arc<dyn Parser>>,
    globals: Vec<(String, Arc<dyn HostGlobal>)>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native module, reachable as `ski:<name>`
    pub fn register_module(&mut self, name: &str, module: impl HostModule + 'static) -> &mut Self {
        let name = name.strip_prefix(NATIVE_PREFIX).unwrap_or(name);
        self.modules.insert(name.to_string(), Arc::new(module));
        self
    }

    /// Register a parser, reachable as `parser:<name>`
    pub fn register_parser(&mut self, name: &str, parser: impl Parser + 'static) -> &mut Self {
        let name = name.strip_prefix(PARSER_PREFIX).unwrap_or(name);
        self.parsers.insert(name.to_string(), Arc::new(parser));
        self
    }

    /// Register bindings installed on the global object of every VM
    pub fn register_global(&mut self, name: &str, global: impl HostGlobal + 'static) -> &mut Self {
        self.globals.retain(|(existing, _)| existing != name);
        self.globals.push((name.to_string(), Arc::new(global)));
        self
    }

    /// Native module by name, without prefix
    pub fn module(&self, name: &str) -> Option<Arc<dyn HostModule>> {
        self.modules.get(name).cloned()
    }

    /// Parser by name, without prefix
    pub fn parser(&self, name: &str) -> Option<Arc<dyn Parser>> {
        self.parsers.get(name).cloned()
    }

    /// Global bindings in registration order
    pub fn globals(&self) -> impl Iterator<Item = (&str, &Arc<dyn HostGlobal>)> {
        self.globals.iter().map(|(name, global)| (name.as_str(), global))
    }

    /// Names of the registered native modules, sorted
    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
