//! Specifier classification and URL arithmetic for module resolution

use thiserror::Error;
use url::Url;

/// Errors raised while resolving or loading a module
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    /// Empty or malformed specifier
    #[error("illegal module name {0:?}")]
    IllegalName(String),

    /// Nothing matched the specifier
    #[error("module {0} not found")]
    NotFound(String),

    /// The resolved source is not a usable module
    #[error("invalid module {module}: {reason}")]
    InvalidModule {
        /// Module id
        module: String,
        /// What is wrong with it
        reason: String,
    },

    /// The module source does not parse
    #[error("{0}")]
    Syntax(String),

    /// No source reader for the URL scheme
    #[error("scheme not supported {0}")]
    UnsupportedScheme(String),

    /// The source reader failed
    #[error("{0}")]
    Read(String),
}

/// Relative or absolute path specifier: `/x`, `./x`, `../x`, `.` or `..`
pub(crate) fn is_base_path(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with('/')
        || specifier.starts_with("./")
        || specifier.starts_with("../")
}

/// Specifier carrying an explicit scheme
pub(crate) fn is_url(specifier: &str) -> bool {
    specifier.contains("://")
}

/// Resolve `name` against the directory URL `base`
pub(crate) fn join(base: &Url, name: &str) -> Result<Url, ModuleError> {
    base.join(name)
        .map_err(|err| ModuleError::IllegalName(format!("{}: {}", name, err)))
}

/// Resolve `name` against `base` as a directory (trailing slash)
pub(crate) fn join_dir(base: &Url, name: &str) -> Result<Url, ModuleError> {
    let trimmed = name.trim_end_matches('/');
    if trimmed.is_empty() {
        return join(base, "/");
    }
    join(base, &format!("{}/", trimmed))
}

/// `url` with `suffix` appended to its path
pub(crate) fn with_suffix(url: &Url, suffix: &str) -> Url {
    let mut candidate = url.clone();
    candidate.set_path(&format!("{}{}", url.path(), suffix));
    candidate
}

/// Directory containing `url`
pub(crate) fn parent_dir(url: &Url) -> Option<Url> {
    url.join("./").ok()
}

/// `node_modules` directory to search under `dir`
pub(crate) fn node_modules_dir(dir: &Url) -> Result<Url, ModuleError> {
    if dir.path().trim_end_matches('/').ends_with("/node_modules") {
        Ok(dir.clone())
    } else {
        join(dir, "node_modules/")
    }
}
