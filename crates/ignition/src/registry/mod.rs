//! Runtime registry
//!
//! Read-only lookup from (language-or-alias, version spec) to an installed
//! runtime descriptor. The registry is populated once at startup by scanning
//! the packages directory and is immutable afterwards, so lookups are safe
//! from any number of tasks.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

pub use crate::registry::runtime::{
    DEFAULT_SANDBOX_PATH, LANGUAGE_ENV_VAR, Runtime, Version,
};

mod loader;
mod runtime;

/// Errors produced while loading or querying the registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no runtime matching '{language}' version '{version}'")]
    NotFound { language: String, version: String },

    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    #[error("failed to read packages directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid package metadata at {path}: {message}")]
    Metadata { path: PathBuf, message: String },
}

/// Immutable collection of installed runtimes
#[derive(Debug, Default)]
pub struct Registry {
    runtimes: Vec<Arc<Runtime>>,
}

impl Registry {
    /// Build a registry from already-constructed descriptors
    pub fn new(runtimes: impl IntoIterator<Item = Runtime>) -> Self {
        Self {
            runtimes: runtimes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Scan a packages directory and load every valid runtime under it
    ///
    /// See [`loader`] for the expected on-disk layout. Malformed packages are
    /// skipped with a warning rather than failing the whole scan.
    pub fn load(packages_root: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        loader::scan(&packages_root.into()).map(Self::new)
    }

    /// Look up a runtime by canonical name or alias and version spec
    ///
    /// When several installed versions match, the highest wins.
    pub fn lookup(&self, language: &str, version: &str) -> Result<Arc<Runtime>, RegistryError> {
        self.runtimes
            .iter()
            .filter(|rt| rt.answers_to(language) && rt.version.satisfies(version))
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                language: language.to_owned(),
                version: version.to_owned(),
            })
    }

    /// All installed runtimes
    pub fn list(&self) -> &[Arc<Runtime>] {
        &self.runtimes
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }
}
