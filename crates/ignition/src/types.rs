use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall clock time limit in milliseconds
    #[serde(default)]
    pub wall_time_ms: Option<u64>,

    /// Memory limit in bytes, -1 for unlimited
    #[serde(default)]
    pub memory_bytes: Option<i64>,

    /// Per-stream output cap in bytes
    #[serde(default)]
    pub max_output_bytes: Option<u64>,

    /// Maximum number of processes/threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum open file descriptors
    #[serde(default)]
    pub max_open_files: Option<u32>,

    /// Maximum size of any file the child may create, in bytes
    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,
}

impl ResourceLimits {
    /// 1 kibibyte in bytes
    pub const KB: u64 = 1024;
    /// 1 mebibyte in bytes
    pub const MB: u64 = 1024 * 1024;

    /// Create new resource limits with all fields set to None
    pub fn new() -> Self {
        Self {
            wall_time_ms: None,
            memory_bytes: None,
            max_output_bytes: None,
            max_processes: None,
            max_open_files: None,
            max_file_size_bytes: None,
        }
    }

    /// Set the wall clock time limit in milliseconds
    pub fn with_wall_time_ms(mut self, ms: u64) -> Self {
        self.wall_time_ms = Some(ms);
        self
    }

    /// Set the memory limit in bytes (-1 for unlimited)
    pub fn with_memory_bytes(mut self, bytes: i64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    /// Set the per-stream output cap in bytes
    pub fn with_max_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Set the maximum number of processes
    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Set the maximum open file descriptors
    pub fn with_max_open_files(mut self, count: u32) -> Self {
        self.max_open_files = Some(count);
        self
    }

    /// Set the maximum created-file size in bytes
    pub fn with_max_file_size_bytes(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = Some(bytes);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    ///
    /// Returns a new ResourceLimits with values from `overrides` taking precedence
    /// over values from `self` when both are present.
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_time_ms: overrides.wall_time_ms.or(self.wall_time_ms),
            memory_bytes: overrides.memory_bytes.or(self.memory_bytes),
            max_output_bytes: overrides.max_output_bytes.or(self.max_output_bytes),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            max_file_size_bytes: overrides.max_file_size_bytes.or(self.max_file_size_bytes),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: Some(3_000),
            memory_bytes: Some(-1),
            max_output_bytes: Some(ResourceLimits::MB),
            max_processes: Some(64),
            max_open_files: Some(2048),
            max_file_size_bytes: Some(10 * ResourceLimits::MB),
        }
    }
}

/// One of the two supervised executions a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Compile,
    Run,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Compile => write!(f, "compile"),
            Stage::Run => write!(f, "run"),
        }
    }
}

/// Which child stream a chunk of output was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Result of one supervised phase (compile or run).
///
/// Exactly one of `exit_code` and `signal` is set for a child that actually
/// started. Both `None` with `message` set means the child never launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Captured standard output, truncated at the output cap
    pub stdout: String,

    /// Captured standard error, truncated at the output cap
    pub stderr: String,

    /// Both streams interleaved in the order chunks were read
    pub output: String,

    /// Exit code if the child exited normally
    pub exit_code: Option<i32>,

    /// Signal name (e.g. "SIGKILL") if the child was killed by a signal
    pub signal: Option<String>,

    /// Wall clock time spent in the phase, in milliseconds
    pub wall_ms: u64,

    /// Diagnostic message ("timeout", launch failure details)
    pub message: Option<String>,
}

impl PhaseResult {
    /// A result for a child that could not be launched at all.
    pub fn launch_failure(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Check if the phase exited normally with status 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Check if the child never started
    #[must_use]
    pub fn is_launch_failure(&self) -> bool {
        self.exit_code.is_none() && self.signal.is_none()
    }
}

impl Default for PhaseResult {
    fn default() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            output: String::new(),
            exit_code: None,
            signal: None,
            wall_ms: 0,
            message: None,
        }
    }
}

/// Final result of a job: the run phase plus, for compiled languages, the
/// compile phase that preceded it.
///
/// `run` is absent when the compile phase failed and the run phase was
/// skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub language: String,
    pub version: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<PhaseResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<PhaseResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_limits_default_has_all_fields() {
        let limits = ResourceLimits::default();
        assert!(limits.wall_time_ms.is_some());
        assert!(limits.memory_bytes.is_some());
        assert!(limits.max_output_bytes.is_some());
        assert!(limits.max_processes.is_some());
        assert!(limits.max_open_files.is_some());
        assert!(limits.max_file_size_bytes.is_some());
    }

    #[test]
    fn resource_limits_new_is_empty() {
        let limits = ResourceLimits::new();
        assert!(limits.wall_time_ms.is_none());
        assert!(limits.memory_bytes.is_none());
        assert!(limits.max_output_bytes.is_none());
    }

    #[test]
    fn resource_limits_builder_methods() {
        let limits = ResourceLimits::new()
            .with_wall_time_ms(5_000)
            .with_memory_bytes(256 * 1024 * 1024)
            .with_max_output_bytes(4096)
            .with_max_processes(4)
            .with_max_open_files(128)
            .with_max_file_size_bytes(1024);

        assert_eq!(limits.wall_time_ms, Some(5_000));
        assert_eq!(limits.memory_bytes, Some(256 * 1024 * 1024));
        assert_eq!(limits.max_output_bytes, Some(4096));
        assert_eq!(limits.max_processes, Some(4));
        assert_eq!(limits.max_open_files, Some(128));
        assert_eq!(limits.max_file_size_bytes, Some(1024));
    }

    #[test]
    fn with_overrides_empty_preserves_base() {
        let base = ResourceLimits::default();
        let result = base.with_overrides(&ResourceLimits::new());
        assert_eq!(result.wall_time_ms, base.wall_time_ms);
        assert_eq!(result.memory_bytes, base.memory_bytes);
        assert_eq!(result.max_output_bytes, base.max_output_bytes);
        assert_eq!(result.max_processes, base.max_processes);
        assert_eq!(result.max_open_files, base.max_open_files);
        assert_eq!(result.max_file_size_bytes, base.max_file_size_bytes);
    }

    #[test]
    fn with_overrides_replaces_values() {
        let base = ResourceLimits::default();
        let overrides = ResourceLimits::new()
            .with_wall_time_ms(10_000)
            .with_memory_bytes(512 * 1024 * 1024);

        let result = base.with_overrides(&overrides);
        assert_eq!(result.wall_time_ms, Some(10_000));
        assert_eq!(result.memory_bytes, Some(512 * 1024 * 1024));
        // Other fields should come from base
        assert_eq!(result.max_output_bytes, base.max_output_bytes);
    }

    #[test]
    fn phase_result_launch_failure_shape() {
        let result = PhaseResult::launch_failure("no such file");
        assert!(result.is_launch_failure());
        assert!(!result.is_success());
        assert_eq!(result.message.as_deref(), Some("no such file"));
        assert!(result.exit_code.is_none());
        assert!(result.signal.is_none());
    }

    #[test]
    fn phase_result_is_success() {
        let ok = PhaseResult {
            exit_code: Some(0),
            ..Default::default()
        };
        let failed = PhaseResult {
            exit_code: Some(1),
            ..Default::default()
        };
        let signaled = PhaseResult {
            signal: Some("SIGKILL".to_owned()),
            ..Default::default()
        };
        assert!(ok.is_success());
        assert!(!failed.is_success());
        assert!(!signaled.is_success());
    }

    #[test]
    fn stage_display() {
        assert_eq!(Stage::Compile.to_string(), "compile");
        assert_eq!(Stage::Run.to_string(), "run");
    }
}
