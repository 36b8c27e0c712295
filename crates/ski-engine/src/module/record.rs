//! Module records

use crate::host::{HostModule, Parser};
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Shared handle to a cached module record
pub type ModuleRef = Arc<ModuleRecord>;

/// What a resolved specifier turned out to be
#[derive(Clone)]
pub enum ModuleKind {
    /// Native host module (`ski:<name>`)
    Native(Arc<dyn HostModule>),
    /// Parser executor module (`parser:<name>`)
    Parser(Arc<dyn Parser>),
    /// CommonJS source wrapped in its `(function(exports, require, module) {...})` envelope
    CommonJs(Arc<str>),
    /// JSON document wrapped as a CommonJS module
    Json(Arc<str>),
    /// ES module source
    EsModule(Arc<str>),
}

impl ModuleKind {
    /// Short name of the kind, for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            ModuleKind::Native(_) => "native",
            ModuleKind::Parser(_) => "parser",
            ModuleKind::CommonJs(_) => "commonjs",
            ModuleKind::Json(_) => "json",
            ModuleKind::EsModule(_) => "esm",
        }
    }
}

impl fmt::Debug for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One resolved, compiled module
#[derive(Debug)]
pub struct ModuleRecord {
    id: String,
    base: Option<Url>,
    kind: ModuleKind,
}

impl ModuleRecord {
    pub(crate) fn new(id: impl Into<String>, base: Option<Url>, kind: ModuleKind) -> Self {
        Self {
            id: id.into(),
            base,
            kind,
        }
    }

    /// Absolute specifier (`file:///...`, `https://...`) or namespaced name
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory that relative imports from this module resolve against
    pub fn base(&self) -> Option<&Url> {
        self.base.as_ref()
    }

    /// Compiled form
    pub fn kind(&self) -> &ModuleKind {
        &self.kind
    }
}
