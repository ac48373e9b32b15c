//! Job orchestration
//!
//! A job is one request's trip through the engine: lease a sandbox slot,
//! stage the request files into it, run the compile phase (if the runtime
//! has one) and then the run phase, and tear everything down. The state
//! machine is strictly monotonic:
//!
//! ```text
//! Created --prime--> Primed --execute--> Executing --> Done --cleanup--> Cleaned
//! ```
//!
//! `cleanup` is additionally legal from every state and idempotent; whatever
//! went wrong earlier, the slot goes back exactly once.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::registry::Runtime;
use crate::sandbox::{SandboxError, Slot, SlotPool};
use crate::supervisor::ProcessLimits;

mod batch;
mod interactive;
mod phase;

/// Errors from job orchestration.
///
/// Phase outcomes (non-zero exits, signals, timeouts, launch failures) are
/// never errors; they come back inside the [`crate::types::JobResult`].
#[derive(Debug, Error)]
pub enum JobError {
    #[error("request contains no files")]
    NoFiles,

    #[error("{operation} requires state {expected:?}, job is {actual:?}")]
    State {
        operation: &'static str,
        expected: JobState,
        actual: JobState,
    },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl JobError {
    /// HTTP-like status class for transport adapters
    pub fn status_code(&self) -> u16 {
        match self {
            JobError::NoFiles => 400,
            JobError::State { .. } => 500,
            JobError::Sandbox(SandboxError::InvalidPath(_)) => 400,
            JobError::Sandbox(SandboxError::Exhausted) => 503,
            JobError::Sandbox(_) => 500,
        }
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Primed,
    Executing,
    Done,
    Cleaned,
}

/// One request file to stage into the slot
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Slot-relative path; the first file in the list is the entry point
    pub path: String,

    pub content: Vec<u8>,

    /// Stage with the executable bit set
    pub executable: bool,
}

/// Everything a job needs, assembled by the transport after validation
#[derive(Debug)]
pub struct JobRequest {
    pub runtime: Arc<Runtime>,

    /// The name the client used, which may be an alias of the runtime's
    /// canonical language; exported to scripts via `PISTON_LANGUAGE`
    pub alias: String,

    pub args: Vec<String>,

    /// Batch-mode stdin payload
    pub stdin: Vec<u8>,

    pub files: Vec<SourceFile>,

    pub compile_limits: ProcessLimits,
    pub run_limits: ProcessLimits,
}

/// Handle for aborting a job's in-flight phase from another task.
///
/// Firing it SIGKILLs the current phase's process group; the owning task
/// then observes the phase ending and is expected to call
/// [`Job::cleanup`].
#[derive(Debug, Clone)]
pub struct KillHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl KillHandle {
    pub fn fire(&self) {
        self.cancel.send_replace(true);
    }
}

/// A single execution request in flight
#[derive(Debug)]
pub struct Job {
    runtime: Arc<Runtime>,
    alias: String,
    args: Vec<String>,
    stdin: Vec<u8>,
    files: Vec<SourceFile>,
    compile_limits: ProcessLimits,
    run_limits: ProcessLimits,

    pool: Arc<SlotPool>,
    state: JobState,
    slot: Option<Slot>,

    /// Flips to true exactly once, on cleanup or kill
    cancel: Arc<watch::Sender<bool>>,
}

impl Job {
    pub fn new(request: JobRequest, pool: Arc<SlotPool>) -> Result<Self, JobError> {
        if request.files.is_empty() {
            return Err(JobError::NoFiles);
        }
        let (cancel, _) = watch::channel(false);
        Ok(Self {
            runtime: request.runtime,
            alias: request.alias,
            args: request.args,
            stdin: request.stdin,
            files: request.files,
            compile_limits: request.compile_limits,
            run_limits: request.run_limits,
            pool,
            state: JobState::Created,
            slot: None,
            cancel: Arc::new(cancel),
        })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle {
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Lease a slot and stage the request files into it.
    ///
    /// On any staging failure the slot goes straight back to the pool and
    /// the job stays in `Created`.
    #[instrument(skip(self), fields(language = %self.runtime.language))]
    pub async fn prime(&mut self) -> Result<(), JobError> {
        self.expect_state("prime", JobState::Created)?;

        let slot = self.pool.acquire().await?;

        for (index, file) in self.files.iter().enumerate() {
            let executable = file.executable || (index == 0 && self.runtime.exec_entry);
            if let Err(e) = slot.stage_file(&file.path, &file.content, executable).await {
                self.pool.release(slot).await;
                return Err(e.into());
            }
        }

        debug!(slot = slot.id(), files = self.files.len(), "job primed");
        self.slot = Some(slot);
        self.state = JobState::Primed;
        Ok(())
    }

    /// Tear the job down: abort any in-flight phase and release the slot.
    ///
    /// Legal from every state; calling it again is a no-op because the slot
    /// handle has already been consumed.
    #[instrument(skip(self))]
    pub async fn cleanup(&mut self) {
        if self.state == JobState::Cleaned {
            return;
        }
        self.cancel.send_replace(true);

        if let Some(slot) = self.slot.take() {
            self.pool.release(slot).await;
        }
        self.state = JobState::Cleaned;
        debug!("job cleaned");
    }

    fn expect_state(&self, operation: &'static str, expected: JobState) -> Result<(), JobError> {
        if self.state != expected {
            return Err(JobError::State {
                operation,
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn slot_ref(&self) -> Result<&Slot, JobError> {
        self.slot.as_ref().ok_or(JobError::State {
            operation: "execute",
            expected: JobState::Primed,
            actual: self.state,
        })
    }

    fn is_canceled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Basenames of all staged files, for the compile argv
    fn file_basenames(&self) -> Vec<String> {
        self.files.iter().map(|f| basename(&f.path)).collect()
    }

    /// Basename of the entry point (the first file)
    fn entry_basename(&self) -> String {
        basename(&self.files[0].path)
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::registry::Version;

    fn test_runtime() -> Arc<Runtime> {
        Arc::new(Runtime {
            language: "python".to_owned(),
            version: Version::parse("3.10.1").unwrap(),
            aliases: vec!["py".to_owned()],
            prefix: "/opt/runtimes/python/3.10.1".into(),
            compile_script: None,
            run_script: "/opt/runtimes/python/3.10.1/run".into(),
            env: HashMap::new(),
            toolchain: "cpython".to_owned(),
            exec_entry: false,
        })
    }

    fn test_request(files: Vec<SourceFile>) -> JobRequest {
        JobRequest {
            runtime: test_runtime(),
            alias: "py".to_owned(),
            args: Vec::new(),
            stdin: Vec::new(),
            files,
            compile_limits: ProcessLimits::default(),
            run_limits: ProcessLimits::default(),
        }
    }

    fn source(path: &str) -> SourceFile {
        SourceFile {
            path: path.to_owned(),
            content: b"print(1)".to_vec(),
            executable: false,
        }
    }

    fn test_pool(root: &Path) -> Arc<SlotPool> {
        Arc::new(SlotPool::new(root, 2, 1500, 1500))
    }

    #[test]
    fn new_job_starts_created() {
        let tmp = tempfile::tempdir().unwrap();
        let job = Job::new(test_request(vec![source("main.py")]), test_pool(tmp.path())).unwrap();
        assert_eq!(job.state(), JobState::Created);
    }

    #[test]
    fn new_job_rejects_empty_file_list() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Job::new(test_request(Vec::new()), test_pool(tmp.path())).unwrap_err();
        assert!(matches!(err, JobError::NoFiles));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn prime_stages_files_and_takes_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path());
        let mut job = Job::new(
            test_request(vec![source("main.py"), source("lib/util.py")]),
            Arc::clone(&pool),
        )
        .unwrap();

        job.prime().await.unwrap();
        assert_eq!(job.state(), JobState::Primed);
        assert_eq!(pool.available(), 1);

        let slot_dir = job.slot_ref().unwrap().dir().to_owned();
        assert!(slot_dir.join("main.py").is_file());
        assert!(slot_dir.join("lib/util.py").is_file());

        job.cleanup().await;
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn prime_twice_is_a_state_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job =
            Job::new(test_request(vec![source("main.py")]), test_pool(tmp.path())).unwrap();

        job.prime().await.unwrap();
        let err = job.prime().await.unwrap_err();
        assert!(matches!(err, JobError::State { .. }));

        job.cleanup().await;
    }

    #[tokio::test]
    async fn prime_path_escape_releases_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path());
        let mut job = Job::new(
            test_request(vec![source("../escape.py")]),
            Arc::clone(&pool),
        )
        .unwrap();

        let err = job.prime().await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        // The slot went back and the job never left Created.
        assert_eq!(pool.available(), 2);
        assert_eq!(job.state(), JobState::Created);
    }

    #[tokio::test]
    async fn prime_under_exhaustion_is_retryable() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = Arc::new(SlotPool::new(tmp.path(), 1, 1500, 1500));

        let mut first = Job::new(test_request(vec![source("a.py")]), Arc::clone(&pool)).unwrap();
        first.prime().await.unwrap();

        let mut second = Job::new(test_request(vec![source("b.py")]), Arc::clone(&pool)).unwrap();
        let err = second.prime().await.unwrap_err();
        assert_eq!(err.status_code(), 503);

        first.cleanup().await;
        second.prime().await.unwrap();
        second.cleanup().await;
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = test_pool(tmp.path());
        let mut job =
            Job::new(test_request(vec![source("main.py")]), Arc::clone(&pool)).unwrap();

        job.prime().await.unwrap();
        job.cleanup().await;
        assert_eq!(job.state(), JobState::Cleaned);
        assert_eq!(pool.available(), 2);

        // Second and third calls change nothing.
        job.cleanup().await;
        job.cleanup().await;
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn cleanup_from_created_is_legal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job =
            Job::new(test_request(vec![source("main.py")]), test_pool(tmp.path())).unwrap();

        job.cleanup().await;
        assert_eq!(job.state(), JobState::Cleaned);
    }

    #[tokio::test]
    async fn execute_before_prime_is_a_state_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job =
            Job::new(test_request(vec![source("main.py")]), test_pool(tmp.path())).unwrap();

        let err = job.execute().await.unwrap_err();
        assert!(matches!(err, JobError::State { .. }));
    }

    #[test]
    fn kill_handle_flips_cancel_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let job = Job::new(test_request(vec![source("main.py")]), test_pool(tmp.path())).unwrap();

        assert!(!job.is_canceled());
        job.kill_handle().fire();
        assert!(job.is_canceled());
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("main.py"), "main.py");
        assert_eq!(basename("src/lib/util.py"), "util.py");
    }
}
