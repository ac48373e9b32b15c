use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::registry::RegistryError;

/// Default PATH exported to supervised children, appended after the
/// runtime's own bin directory.
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Environment variable carrying the request alias into compile/run scripts,
/// so a script shared between aliases can branch on it.
pub const LANGUAGE_ENV_VAR: &str = "PISTON_LANGUAGE";

/// A parsed runtime version: dot-separated numeric components compared
/// semver-style ("3.10.1" < "3.11").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(Vec<u64>);

impl Version {
    pub fn parse(raw: &str) -> Result<Self, RegistryError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RegistryError::InvalidVersion(raw.to_owned()));
        }
        let components = trimmed
            .split('.')
            .map(|part| part.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| RegistryError::InvalidVersion(raw.to_owned()))?;
        Ok(Self(components))
    }

    /// Check whether this version satisfies a requested version spec.
    ///
    /// `"*"` and the empty spec match everything. Otherwise the spec is a
    /// dot-separated numeric prefix: `"3"` matches 3.x.y, `"3.10"` matches
    /// 3.10.x, and a full `"3.10.1"` matches exactly.
    pub fn satisfies(&self, spec: &str) -> bool {
        let spec = spec.trim();
        if spec.is_empty() || spec == "*" {
            return true;
        }
        let Ok(Version(wanted)) = Version::parse(spec) else {
            return false;
        };
        wanted.len() <= self.0.len() && self.0[..wanted.len()] == wanted[..]
    }

    pub fn components(&self) -> &[u64] {
        &self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a dot-separated numeric version like \"3.10.1\"",
            )
        })
    }
}

/// An installed runtime: one (language, version) pair with its compile/run
/// scripts and base environment.
///
/// Descriptors are immutable after loading and shared between jobs via `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    /// Canonical language name (e.g. "python")
    pub language: String,

    /// Parsed version
    pub version: Version,

    /// Alternative request names. Aliases may collide across versions; the
    /// registry resolves a collision by picking the highest version.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Absolute install prefix of the runtime package
    pub prefix: PathBuf,

    /// Compile script (None for interpreted languages)
    #[serde(default)]
    pub compile_script: Option<PathBuf>,

    /// Run script
    pub run_script: PathBuf,

    /// Extra environment exported to both phases
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Free-form toolchain family label (e.g. "cpython", "gcc")
    #[serde(default)]
    pub toolchain: String,

    /// Whether the staged entry-point file needs the executable bit
    #[serde(default)]
    pub exec_entry: bool,
}

impl Runtime {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile_script.is_some()
    }

    /// Check whether a request name refers to this runtime
    pub fn answers_to(&self, name: &str) -> bool {
        self.language == name || self.aliases.iter().any(|alias| alias == name)
    }

    /// Build the environment for a supervised phase.
    ///
    /// The request alias rides along in `PISTON_LANGUAGE`; HOME points at the
    /// sandbox scratch directory so toolchains with cache directories stay
    /// inside the slot.
    pub fn phase_env(&self, alias: &str, cwd: &std::path::Path) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.insert(
            "PATH".to_owned(),
            format!("{}:{}", self.prefix.join("bin").display(), DEFAULT_SANDBOX_PATH),
        );
        env.insert(LANGUAGE_ENV_VAR.to_owned(), alias.to_owned());
        env.insert("HOME".to_owned(), cwd.display().to_string());
        env.insert("TMPDIR".to_owned(), cwd.display().to_string());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(language: &str, version: &str, aliases: &[&str]) -> Runtime {
        Runtime {
            language: language.to_owned(),
            version: Version::parse(version).unwrap(),
            aliases: aliases.iter().map(|s| (*s).to_owned()).collect(),
            prefix: PathBuf::from("/opt/runtimes/test"),
            compile_script: None,
            run_script: PathBuf::from("/opt/runtimes/test/run"),
            env: HashMap::new(),
            toolchain: String::new(),
            exec_entry: false,
        }
    }

    #[test]
    fn version_parse_valid() {
        let v = Version::parse("3.10.1").unwrap();
        assert_eq!(v.components(), &[3, 10, 1]);
        assert_eq!(v.to_string(), "3.10.1");
    }

    #[test]
    fn version_parse_single_component() {
        let v = Version::parse("18").unwrap();
        assert_eq!(v.components(), &[18]);
    }

    #[test]
    fn version_parse_rejects_garbage() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("abc").is_err());
        assert!(Version::parse("3.x").is_err());
        assert!(Version::parse("3..1").is_err());
        assert!(Version::parse("-1").is_err());
    }

    #[test]
    fn version_ordering_is_numeric() {
        let a = Version::parse("3.9").unwrap();
        let b = Version::parse("3.10").unwrap();
        let c = Version::parse("3.10.1").unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn version_satisfies_wildcard() {
        let v = Version::parse("3.10.1").unwrap();
        assert!(v.satisfies("*"));
        assert!(v.satisfies(""));
        assert!(v.satisfies("  "));
    }

    #[test]
    fn version_satisfies_prefix() {
        let v = Version::parse("3.10.1").unwrap();
        assert!(v.satisfies("3"));
        assert!(v.satisfies("3.10"));
        assert!(v.satisfies("3.10.1"));
        assert!(!v.satisfies("3.1"));
        assert!(!v.satisfies("3.10.1.2"));
        assert!(!v.satisfies("4"));
    }

    #[test]
    fn version_satisfies_rejects_malformed_spec() {
        let v = Version::parse("3.10.1").unwrap();
        assert!(!v.satisfies("latest"));
        assert!(!v.satisfies("3.x"));
    }

    #[test]
    fn runtime_answers_to_name_and_alias() {
        let rt = runtime("python", "3.10.1", &["py", "python3"]);
        assert!(rt.answers_to("python"));
        assert!(rt.answers_to("py"));
        assert!(rt.answers_to("python3"));
        assert!(!rt.answers_to("ruby"));
    }

    #[test]
    fn runtime_is_compiled() {
        let mut rt = runtime("c", "10.2.0", &[]);
        assert!(!rt.is_compiled());
        rt.compile_script = Some(PathBuf::from("/opt/runtimes/test/compile"));
        assert!(rt.is_compiled());
    }

    #[test]
    fn phase_env_exports_alias_and_path() {
        let mut rt = runtime("python", "3.10.1", &["py"]);
        rt.env.insert("PYTHONPATH".to_owned(), "/opt/lib".to_owned());

        let env = rt.phase_env("py", std::path::Path::new("/tmp/ignition/0"));
        assert_eq!(env.get(LANGUAGE_ENV_VAR).map(String::as_str), Some("py"));
        assert_eq!(env.get("HOME").map(String::as_str), Some("/tmp/ignition/0"));
        assert_eq!(env.get("PYTHONPATH").map(String::as_str), Some("/opt/lib"));

        let path = env.get("PATH").expect("PATH must be set");
        assert!(path.starts_with("/opt/runtimes/test/bin:"));
        assert!(path.ends_with(DEFAULT_SANDBOX_PATH));
    }
}
