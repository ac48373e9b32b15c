//! Service configuration
//!
//! Loaded once at startup from TOML (see `ignition.example.toml`, embedded
//! as [`EXAMPLE_CONFIG`]). Everything here is a deployment decision: where
//! runtimes and scratch directories live, how many slots exist, which uid
//! range they own, and the ceilings no request may exceed.

use std::path::PathBuf;

use config::{Config as ConfigBuilder, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

use crate::supervisor::ProcessLimits;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../ignition.example.toml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory scanned for installed runtimes
    pub packages_root: PathBuf,

    /// Root of the per-slot scratch directories
    pub sandbox_root: PathBuf,

    /// Number of sandbox slots (and therefore of concurrent jobs)
    pub slot_count: u32,

    /// First uid of the slot range; slot N runs as base_uid + N
    pub base_uid: u32,

    /// First gid of the slot range
    pub base_gid: u32,

    /// Concurrent job cap per client identity
    pub per_client_max_jobs: usize,

    /// Concurrent job cap across all clients
    pub global_max_jobs: usize,

    /// Default and ceiling resource limits
    pub limits: LimitConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from(path.as_ref()))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_count == 0 {
            return Err(ConfigError::Invalid("slot_count must be at least 1".into()));
        }
        if self.per_client_max_jobs == 0 || self.global_max_jobs == 0 {
            return Err(ConfigError::Invalid(
                "concurrency caps must be at least 1".into(),
            ));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_output_bytes must be at least 1".into(),
            ));
        }
        if self.limits.max_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packages_root: PathBuf::from("packages"),
            sandbox_root: PathBuf::from("/tmp/ignition"),
            slot_count: 8,
            base_uid: 1500,
            base_gid: 1500,
            per_client_max_jobs: 4,
            global_max_jobs: 16,
            limits: LimitConfig::default(),
        }
    }
}

/// Default and ceiling limits applied to every phase
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Default compile wall clock budget in milliseconds
    pub compile_timeout_ms: u64,

    /// Default run wall clock budget in milliseconds
    pub run_timeout_ms: u64,

    /// Hard ceiling on any requested timeout
    pub max_timeout_ms: u64,

    /// Default compile memory limit in bytes, -1 for unlimited
    pub compile_memory_bytes: i64,

    /// Default run memory limit in bytes, -1 for unlimited
    pub run_memory_bytes: i64,

    /// Ceiling on any requested memory limit, -1 for no ceiling
    pub max_memory_bytes: i64,

    /// Per-stream output capture cap in bytes
    pub max_output_bytes: u64,

    /// Process count rlimit
    pub max_processes: u32,

    /// Open file descriptor rlimit
    pub max_open_files: u32,

    /// Created-file size rlimit in bytes
    pub max_file_size_bytes: u64,
}

impl LimitConfig {
    /// Limits for a compile phase, honoring request overrides
    pub fn compile_limits(
        &self,
        requested_ms: Option<u64>,
        requested_memory: Option<i64>,
    ) -> ProcessLimits {
        self.phase_limits(
            requested_ms.unwrap_or(self.compile_timeout_ms),
            requested_memory.unwrap_or(self.compile_memory_bytes),
        )
    }

    /// Limits for a run phase, honoring request overrides
    pub fn run_limits(
        &self,
        requested_ms: Option<u64>,
        requested_memory: Option<i64>,
    ) -> ProcessLimits {
        self.phase_limits(
            requested_ms.unwrap_or(self.run_timeout_ms),
            requested_memory.unwrap_or(self.run_memory_bytes),
        )
    }

    fn phase_limits(&self, wall_ms: u64, memory: i64) -> ProcessLimits {
        ProcessLimits {
            wall_ms: wall_ms.min(self.max_timeout_ms),
            memory_bytes: effective_memory(memory, self.max_memory_bytes),
            max_output_bytes: self.max_output_bytes,
            max_processes: self.max_processes,
            max_open_files: self.max_open_files,
            max_file_size_bytes: self.max_file_size_bytes,
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            compile_timeout_ms: 10_000,
            run_timeout_ms: 3_000,
            max_timeout_ms: 60_000,
            compile_memory_bytes: -1,
            run_memory_bytes: -1,
            max_memory_bytes: -1,
            max_output_bytes: 1024 * 1024,
            max_processes: 64,
            max_open_files: 2048,
            max_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Resolve a requested memory limit (-1 = unlimited) against the configured
/// ceiling (-1 = no ceiling)
fn effective_memory(requested: i64, ceiling: i64) -> Option<u64> {
    match (requested < 0, ceiling < 0) {
        (true, true) => None,
        (true, false) => Some(ceiling as u64),
        (false, true) => Some(requested as u64),
        (false, false) => Some(requested.min(ceiling) as u64),
    }
}
