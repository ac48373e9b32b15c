//! Engine facade
//!
//! Ties the pieces together for transport adapters: one `Engine` owns the
//! registry, the slot pool, and the governor, and walks a request through
//! the whole job lifecycle. Adapters that need finer control (the
//! interactive session handler, mostly) can still drive [`Job`] directly.

use std::sync::Arc;

use thiserror::Error;
use tracing::instrument;

use crate::api::{ApiError, ExecuteRequest};
use crate::bus::EventBus;
use crate::config::Config;
use crate::governor::{Governor, GovernorError};
use crate::job::{Job, JobError, JobRequest};
use crate::registry::{Registry, RegistryError};
use crate::sandbox::SlotPool;
use crate::types::JobResult;

/// Top-level error for a request run through the facade
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Governor(#[from] GovernorError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl EngineError {
    /// HTTP-like status class: validation 4xx, saturation 429/503,
    /// everything unexpected 5xx
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Registry(RegistryError::NotFound { .. })
            | EngineError::Registry(RegistryError::InvalidVersion(_)) => 400,
            EngineError::Registry(_) => 500,
            EngineError::Governor(_) => 429,
            EngineError::Api(e) => e.status_code(),
            EngineError::Job(e) => e.status_code(),
        }
    }

    /// Whether the client may simply retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self.status_code(), 429 | 503)
    }
}

/// The assembled execution engine
#[derive(Debug)]
pub struct Engine {
    config: Config,
    registry: Arc<Registry>,
    pool: Arc<SlotPool>,
    governor: Governor,
}

impl Engine {
    /// Build an engine around an already-loaded registry
    pub fn new(config: Config, registry: Registry) -> Self {
        let pool = SlotPool::new(
            &config.sandbox_root,
            config.slot_count,
            config.base_uid,
            config.base_gid,
        );
        let governor = Governor::new(config.per_client_max_jobs, config.global_max_jobs);
        Self {
            config,
            registry: Arc::new(registry),
            pool: Arc::new(pool),
            governor,
        }
    }

    /// Build an engine, scanning the configured packages directory
    pub fn from_config(config: Config) -> Result<Self, EngineError> {
        let registry = Registry::load(&config.packages_root)?;
        Ok(Self::new(config, registry))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Resolve a request into a ready-to-prime job
    pub fn build_job(&self, request: &ExecuteRequest) -> Result<Job, EngineError> {
        let runtime = self.registry.lookup(&request.language, &request.version)?;
        let files = request.source_files()?;

        let job_request = JobRequest {
            runtime,
            alias: request.language.clone(),
            args: request.args.clone(),
            stdin: request.stdin.clone().into_bytes(),
            files,
            compile_limits: self
                .config
                .limits
                .compile_limits(request.compile_timeout, request.compile_memory_limit),
            run_limits: self
                .config
                .limits
                .run_limits(request.run_timeout, request.run_memory_limit),
        };

        Ok(Job::new(job_request, Arc::clone(&self.pool))?)
    }

    /// Run a batch request end to end.
    ///
    /// `client` is the caller's identity for concurrency accounting,
    /// typically the remote address.
    #[instrument(skip(self, request), fields(language = %request.language, client))]
    pub async fn execute(
        &self,
        request: &ExecuteRequest,
        client: &str,
    ) -> Result<JobResult, EngineError> {
        let _ticket = self.governor.try_enter(client)?;
        let mut job = self.build_job(request)?;

        if let Err(e) = job.prime().await {
            job.cleanup().await;
            return Err(e.into());
        }

        let outcome = job.execute().await;
        job.cleanup().await;
        Ok(outcome?)
    }

    /// Run a request end to end in interactive mode, streaming through `bus`.
    #[instrument(skip(self, request, bus), fields(language = %request.language, client))]
    pub async fn execute_interactive(
        &self,
        request: &ExecuteRequest,
        client: &str,
        bus: &EventBus,
    ) -> Result<JobResult, EngineError> {
        let _ticket = self.governor.try_enter(client)?;
        let mut job = self.build_job(request)?;

        if let Err(e) = job.prime().await {
            job.cleanup().await;
            return Err(e.into());
        }

        let outcome = job.execute_interactive(bus).await;
        job.cleanup().await;
        Ok(outcome?)
    }
}
