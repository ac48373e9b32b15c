//! Package directory scanning
//!
//! Runtimes are installed under `<packages_root>/<language>/<version>/`.
//! Each package directory holds:
//!
//! - `run` (required): the script invoked for the run phase
//! - `compile` (optional): present only for compiled languages
//! - `package.toml` (optional): aliases, toolchain label, environment
//!
//! A package that fails to parse is skipped with a warning; a broken package
//! must not take the whole registry down with it.

use std::collections::HashMap;
use std::path::Path;

use config::{Config as ConfigBuilder, File};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::registry::{RegistryError, Runtime, Version};

/// Optional per-package metadata file name
const PACKAGE_META: &str = "package.toml";

#[derive(Debug, Default, Deserialize)]
struct PackageMeta {
    #[serde(default)]
    aliases: Vec<String>,

    #[serde(default)]
    toolchain: String,

    #[serde(default)]
    exec_entry: bool,

    #[serde(default)]
    env: HashMap<String, String>,
}

impl PackageMeta {
    fn load(path: &Path) -> Result<Self, RegistryError> {
        let parsed = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()
            .and_then(|config| config.try_deserialize::<PackageMeta>())
            .map_err(|e| RegistryError::Metadata {
                path: path.to_owned(),
                message: e.to_string(),
            })?;
        Ok(parsed)
    }
}

/// Scan the packages root and build descriptors for every installed runtime
pub(super) fn scan(root: &Path) -> Result<Vec<Runtime>, RegistryError> {
    let mut runtimes = Vec::new();

    let languages = std::fs::read_dir(root).map_err(|source| RegistryError::ReadDir {
        path: root.to_owned(),
        source,
    })?;

    for language_entry in languages.flatten() {
        let language_dir = language_entry.path();
        if !language_dir.is_dir() {
            continue;
        }
        let language = language_entry.file_name().to_string_lossy().into_owned();

        let versions = std::fs::read_dir(&language_dir).map_err(|source| {
            RegistryError::ReadDir {
                path: language_dir.clone(),
                source,
            }
        })?;

        for version_entry in versions.flatten() {
            let package_dir = version_entry.path();
            if !package_dir.is_dir() {
                continue;
            }
            let raw_version = version_entry.file_name().to_string_lossy().into_owned();

            match load_package(&language, &raw_version, &package_dir) {
                Ok(runtime) => {
                    debug!(
                        language = %runtime.language,
                        version = %runtime.version,
                        "loaded runtime"
                    );
                    runtimes.push(runtime);
                }
                Err(e) => {
                    warn!(
                        language = %language,
                        version = %raw_version,
                        error = %e,
                        "skipping invalid package"
                    );
                }
            }
        }
    }

    Ok(runtimes)
}

fn load_package(
    language: &str,
    raw_version: &str,
    package_dir: &Path,
) -> Result<Runtime, RegistryError> {
    let version = Version::parse(raw_version)?;

    let run_script = package_dir.join("run");
    if !run_script.is_file() {
        return Err(RegistryError::Metadata {
            path: package_dir.to_owned(),
            message: "missing run script".to_owned(),
        });
    }

    let compile_script = package_dir.join("compile");
    let compile_script = compile_script.is_file().then_some(compile_script);

    let meta_path = package_dir.join(PACKAGE_META);
    let meta = if meta_path.is_file() {
        PackageMeta::load(&meta_path)?
    } else {
        PackageMeta::default()
    };

    Ok(Runtime {
        language: language.to_owned(),
        version,
        aliases: meta.aliases,
        prefix: package_dir.to_owned(),
        compile_script,
        run_script,
        env: meta.env,
        toolchain: meta.toolchain,
        exec_entry: meta.exec_entry,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_package(
        root: &Path,
        language: &str,
        version: &str,
        compiled: bool,
        meta: Option<&str>,
    ) {
        let dir = root.join(language).join(version);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("run"), "#!/bin/sh\n").unwrap();
        if compiled {
            fs::write(dir.join("compile"), "#!/bin/sh\n").unwrap();
        }
        if let Some(meta) = meta {
            fs::write(dir.join(PACKAGE_META), meta).unwrap();
        }
    }

    #[test]
    fn scan_finds_interpreted_and_compiled() {
        let root = tempfile::tempdir().unwrap();
        write_package(root.path(), "python", "3.10.1", false, None);
        write_package(root.path(), "c", "10.2.0", true, None);

        let mut runtimes = scan(root.path()).unwrap();
        runtimes.sort_by(|a, b| a.language.cmp(&b.language));

        assert_eq!(runtimes.len(), 2);
        assert_eq!(runtimes[0].language, "c");
        assert!(runtimes[0].is_compiled());
        assert_eq!(runtimes[1].language, "python");
        assert!(!runtimes[1].is_compiled());
    }

    #[test]
    fn scan_reads_package_metadata() {
        let root = tempfile::tempdir().unwrap();
        write_package(
            root.path(),
            "python",
            "3.10.1",
            false,
            Some(
                r#"
aliases = ["py", "python3"]
toolchain = "cpython"

[env]
PYTHONUNBUFFERED = "1"
"#,
            ),
        );

        let runtimes = scan(root.path()).unwrap();
        assert_eq!(runtimes.len(), 1);
        let rt = &runtimes[0];
        assert_eq!(rt.aliases, vec!["py", "python3"]);
        assert_eq!(rt.toolchain, "cpython");
        assert_eq!(
            rt.env.get("PYTHONUNBUFFERED").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn scan_skips_package_without_run_script() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("broken").join("1.0.0");
        fs::create_dir_all(&dir).unwrap();

        let runtimes = scan(root.path()).unwrap();
        assert!(runtimes.is_empty());
    }

    #[test]
    fn scan_skips_non_numeric_version_dir() {
        let root = tempfile::tempdir().unwrap();
        write_package(root.path(), "python", "latest", false, None);
        write_package(root.path(), "python", "3.10.1", false, None);

        let runtimes = scan(root.path()).unwrap();
        assert_eq!(runtimes.len(), 1);
        assert_eq!(runtimes[0].version.to_string(), "3.10.1");
    }

    #[test]
    fn scan_missing_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        assert!(scan(&missing).is_err());
    }
}
