//! Module loader
//!
//! Maps a specifier, seen from a referencing module, to a compiled
//! [`ModuleRecord`]. Resolution order:
//!
//! 1. `ski:<name>`: native host module from the registry
//! 2. `parser:<name>`: parser executor module from the registry
//! 3. `/x`, `./x`, `../x`, `.`, `..`: file or directory, relative to the
//!    referencing module's directory (or the configured base)
//! 4. `scheme://...`: read directly through the source reader
//! 5. anything else: `node_modules` search upward from the configured base
//!
//! Every outcome for an absolute specifier, success or failure, is cached
//! for the loader's lifetime. A reverse map from module id to its directory
//! lets later relative imports from that module resolve.
//!
//! The loader lock only guards the maps. Sources are read and compiled
//! outside it, in a per-specifier slot: callers asking for the same module
//! wait for its first load, everyone else goes on.

mod compiler;
mod record;
mod registry;
mod resolver;
mod source;
pub mod syntax;

pub use compiler::Compiler;
pub use record::{ModuleKind, ModuleRecord, ModuleRef};
pub use registry::ModuleRegistry;
pub use resolver::ModuleError;
pub use source::{DefaultSourceReader, SourceError, SourceReader};

use crate::vm::VmError;
use crate::{NATIVE_PREFIX, PARSER_PREFIX};
use parking_lot::Mutex;
use resolver::{is_base_path, is_url, join, join_dir, node_modules_dir, parent_dir, with_suffix};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use url::Url;

/// Loader configuration
#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Directory used when there is no referencing module and as the start
    /// of the `node_modules` search. Defaults to the working directory.
    pub base: Option<Url>,
}

impl LoaderOptions {
    /// Use a filesystem directory as the base
    pub fn with_dir(dir: impl Into<PathBuf>) -> Result<Self, ModuleError> {
        let dir = dir.into();
        let dir = if dir.is_absolute() {
            dir
        } else {
            std::env::current_dir()
                .map_err(|err| ModuleError::Read(err.to_string()))?
                .join(dir)
        };
        let base = Url::from_directory_path(&dir)
            .map_err(|_| ModuleError::IllegalName(dir.display().to_string()))?;
        Ok(Self { base: Some(base) })
    }
}

#[derive(Deserialize)]
struct PackageManifest {
    #[serde(default)]
    main: Option<String>,
}

/// Outcome of loading one absolute specifier, filled in once
type ModuleSlot = Arc<OnceLock<Result<ModuleRef, ModuleError>>>;

#[derive(Default)]
struct LoaderState {
    modules: FxHashMap<String, ModuleSlot>,
    natives: FxHashMap<String, ModuleRef>,
    parsers: FxHashMap<String, ModuleRef>,
    reverse: FxHashMap<String, Url>,
    /// `main` of each `package.json` read, by manifest URL
    manifests: FxHashMap<String, Option<String>>,
}

/// Resolves, compiles and caches modules for every VM sharing it
pub struct ModuleLoader {
    base: Url,
    reader: Arc<dyn SourceReader>,
    registry: ModuleRegistry,
    compiler: Compiler,
    state: Mutex<LoaderState>,
}

impl ModuleLoader {
    /// Create a loader
    pub fn new(
        options: LoaderOptions,
        reader: Arc<dyn SourceReader>,
        registry: ModuleRegistry,
    ) -> Result<Self, VmError> {
        let base = match options.base {
            Some(base) => base,
            None => LoaderOptions::with_dir(".")?.base.ok_or_else(|| {
                VmError::Engine("working directory is not a valid base".to_string())
            })?,
        };
        Ok(Self {
            base,
            reader,
            registry,
            compiler: Compiler::new()?,
            state: Mutex::new(LoaderState::default()),
        })
    }

    /// Loader over the working directory with the default source reader
    pub fn with_registry(registry: ModuleRegistry) -> Result<Self, VmError> {
        Self::new(
            LoaderOptions::default(),
            Arc::new(DefaultSourceReader::default()),
            registry,
        )
    }

    /// Configured base directory
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Host modules, globals and parsers
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub(crate) fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    /// Resolve `specifier` as seen from the module `referrer` (a module id),
    /// or from the configured base when there is none.
    pub fn resolve(
        &self,
        referrer: Option<&str>,
        specifier: &str,
    ) -> Result<ModuleRef, ModuleError> {
        if specifier.is_empty() {
            return Err(ModuleError::IllegalName(specifier.to_string()));
        }

        if let Some(name) = specifier.strip_prefix(NATIVE_PREFIX) {
            return self.native(specifier, name);
        }
        if let Some(name) = specifier.strip_prefix(PARSER_PREFIX) {
            return self.parser(specifier, name);
        }

        if is_base_path(specifier) {
            let base = self.referrer_base(referrer);
            return self.load_as_file_or_directory(&base, specifier);
        }
        if is_url(specifier) {
            let url = Url::parse(specifier)
                .map_err(|err| ModuleError::IllegalName(format!("{}: {}", specifier, err)))?;
            return self.load_module(&url);
        }
        self.load_node_modules(specifier)
    }

    /// Cached record for a module id, if resolution already produced one
    pub fn cached(&self, id: &str) -> Option<ModuleRef> {
        let state = self.state.lock();
        if let Some(name) = id.strip_prefix(NATIVE_PREFIX) {
            return state.natives.get(name).cloned();
        }
        if let Some(name) = id.strip_prefix(PARSER_PREFIX) {
            return state.parsers.get(name).cloned();
        }
        state
            .modules
            .get(id)
            .and_then(|slot| slot.get())
            .and_then(|result| result.as_ref().ok().cloned())
    }

    /// Directory relative imports from module `id` resolve against
    pub fn base_of(&self, id: &str) -> Option<Url> {
        self.state.lock().reverse.get(id).cloned()
    }

    /// Number of cached absolute specifiers, failures included
    pub fn cached_count(&self) -> usize {
        self.state
            .lock()
            .modules
            .values()
            .filter(|slot| slot.get().is_some())
            .count()
    }

    fn referrer_base(&self, referrer: Option<&str>) -> Url {
        referrer
            .and_then(|referrer| {
                self.base_of(referrer).or_else(|| {
                    // A unit run directly under its own URL (not through the
                    // loader) still resolves relative to its directory.
                    Url::parse(referrer)
                        .ok()
                        .filter(|url| matches!(url.scheme(), "file" | "http" | "https"))
                        .and_then(|url| parent_dir(&url))
                })
            })
            .unwrap_or_else(|| self.base.clone())
    }

    fn native(&self, specifier: &str, name: &str) -> Result<ModuleRef, ModuleError> {
        let mut state = self.state.lock();
        if let Some(record) = state.natives.get(name) {
            return Ok(record.clone());
        }
        let module = self
            .registry
            .module(name)
            .ok_or_else(|| ModuleError::NotFound(specifier.to_string()))?;
        let record = Arc::new(ModuleRecord::new(specifier, None, ModuleKind::Native(module)));
        state.natives.insert(name.to_string(), record.clone());
        Ok(record)
    }

    fn parser(&self, specifier: &str, name: &str) -> Result<ModuleRef, ModuleError> {
        let mut state = self.state.lock();
        if let Some(record) = state.parsers.get(name) {
            return Ok(record.clone());
        }
        let parser = self
            .registry
            .parser(name)
            .ok_or_else(|| ModuleError::NotFound(specifier.to_string()))?;
        let record = Arc::new(ModuleRecord::new(specifier, None, ModuleKind::Parser(parser)));
        state.parsers.insert(name.to_string(), record.clone());
        Ok(record)
    }

    fn load_as_file_or_directory(&self, base: &Url, name: &str) -> Result<ModuleRef, ModuleError> {
        let file = join(base, name)?;
        match self.load_as_file(&file) {
            Err(ModuleError::NotFound(_)) => {}
            resolved => return resolved,
        }
        let dir = join_dir(base, name)?;
        self.load_as_directory(&dir)
    }

    /// `url`, then `url.js`, then `url.json`
    fn load_as_file(&self, url: &Url) -> Result<ModuleRef, ModuleError> {
        if !url.path().ends_with('/') {
            for candidate in [url.clone(), with_suffix(url, ".js"), with_suffix(url, ".json")] {
                match self.load_module(&candidate) {
                    Err(ModuleError::NotFound(_)) => continue,
                    resolved => return resolved,
                }
            }
        }
        Err(ModuleError::NotFound(url.to_string()))
    }

    /// `package.json` main, falling back to `index.js`
    fn load_as_directory(&self, dir: &Url) -> Result<ModuleRef, ModuleError> {
        if let Some(main) = self.package_main(dir) {
            let target = join(dir, &main)?;
            match self.load_as_file(&target) {
                Err(ModuleError::NotFound(_)) => {}
                resolved => return resolved,
            }
        }
        self.load_module(&join(dir, "index.js")?)
    }

    /// `main` of `dir/package.json`. Read outside the lock; when two
    /// callers race, the first answer stored wins.
    fn package_main(&self, dir: &Url) -> Option<String> {
        let manifest = join(dir, "package.json").ok()?;
        if let Some(main) = self.state.lock().manifests.get(manifest.as_str()) {
            return main.clone();
        }
        let main = self
            .reader
            .read(&manifest, "package.json")
            .ok()
            .and_then(|bytes| match serde_json::from_slice::<PackageManifest>(&bytes) {
                Ok(package) => package.main.filter(|main| !main.is_empty()),
                Err(err) => {
                    debug!(url = %manifest, error = %err, "ignoring unreadable package.json");
                    None
                }
            });
        self.state
            .lock()
            .manifests
            .entry(manifest.to_string())
            .or_insert(main)
            .clone()
    }

    fn load_node_modules(&self, specifier: &str) -> Result<ModuleRef, ModuleError> {
        let mut dir = self.base.clone();
        loop {
            let modules = node_modules_dir(&dir)?;
            match self.load_as_file_or_directory(&modules, specifier) {
                Err(ModuleError::NotFound(_)) => {}
                resolved => return resolved,
            }
            let parent = join(&dir, "..")?;
            if parent == dir {
                break;
            }
            dir = parent;
        }
        debug!(specifier, "module not found in any node_modules");
        Err(ModuleError::NotFound(specifier.to_string()))
    }

    /// Read and compile `url`, memoized by its absolute form
    fn load_module(&self, url: &Url) -> Result<ModuleRef, ModuleError> {
        let id = url.as_str();
        let slot = self
            .state
            .lock()
            .modules
            .entry(id.to_string())
            .or_default()
            .clone();
        if let Some(cached) = slot.get() {
            return cached.clone();
        }

        slot.get_or_init(|| {
            let result = self.read_and_compile(url);
            if let Ok(record) = &result {
                if let Some(base) = record.base() {
                    self.state.lock().reverse.insert(id.to_string(), base.clone());
                }
                debug!(module = id, kind = record.kind().name(), "module compiled");
            }
            result
        })
        .clone()
    }

    fn read_and_compile(&self, url: &Url) -> Result<ModuleRef, ModuleError> {
        let id = url.as_str();
        let bytes = self.reader.read(url, id).map_err(|err| match err {
            SourceError::NotFound(what) => ModuleError::NotFound(what),
            SourceError::UnsupportedScheme(scheme) => ModuleError::UnsupportedScheme(scheme),
            other => ModuleError::Read(other.to_string()),
        })?;
        let source = String::from_utf8(bytes).map_err(|_| ModuleError::InvalidModule {
            module: id.to_string(),
            reason: "source is not valid UTF-8".to_string(),
        })?;
        let kind = self.compile(id, url.path(), &source)?;
        Ok(Arc::new(ModuleRecord::new(id, parent_dir(url), kind)))
    }

    fn compile(&self, id: &str, path: &str, source: &str) -> Result<ModuleKind, ModuleError> {
        if path.ends_with(".json") {
            serde_json::from_str::<serde_json::Value>(source).map_err(|err| {
                ModuleError::Syntax(format!("SyntaxError: invalid JSON: {} ({})", err, id))
            })?;
            let body = format!(
                "module.exports = JSON.parse({});",
                serde_json::Value::from(source)
            );
            return Ok(ModuleKind::Json(commonjs_envelope(&body).into()));
        }

        if syntax::is_es_module(source) {
            self.compiler
                .check_module(id, source)
                .map_err(syntax_error)?;
            return Ok(ModuleKind::EsModule(source.into()));
        }

        let envelope = commonjs_envelope(source);
        self.compiler
            .check_envelope(id, &envelope)
            .map_err(syntax_error)?;
        Ok(ModuleKind::CommonJs(envelope.into()))
    }
}

fn commonjs_envelope(source: &str) -> String {
    format!("(function(exports, require, module) {{{}\n}})", source)
}

fn syntax_error(err: VmError) -> ModuleError {
    match err {
        VmError::Syntax(text) => ModuleError::Syntax(text),
        other => ModuleError::InvalidModule {
            module: String::new(),
            reason: other.to_string(),
        },
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("base", &self.base.as_str())
            .field("cached", &self.cached_count())
            .finish()
    }
}
