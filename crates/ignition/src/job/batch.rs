//! Batch execution
//!
//! The whole request is known up front: stdin is a buffer, output is
//! captured, and the caller gets one [`JobResult`] when both phases are
//! done.

use tracing::instrument;

use crate::job::{Job, JobError, JobState, phase};
use crate::supervisor::StdinSource;
use crate::types::{JobResult, Stage};

impl Job {
    /// Run the compile phase (for compiled runtimes) and then the run phase.
    ///
    /// A compile phase that exits non-zero, dies to a signal, or fails to
    /// launch skips the run phase; its result still comes back in
    /// `JobResult::compile`.
    #[instrument(skip(self), fields(language = %self.runtime.language))]
    pub async fn execute(&mut self) -> Result<JobResult, JobError> {
        self.expect_state("execute", JobState::Primed)?;
        self.state = JobState::Executing;

        let slot = self.slot_ref()?;
        let mut result = JobResult {
            language: self.runtime.language.clone(),
            version: self.runtime.version.to_string(),
            compile: None,
            run: None,
        };

        if self.runtime.is_compiled() {
            let compile = phase::run_phase(
                &self.runtime,
                &self.alias,
                slot,
                Stage::Compile,
                self.file_basenames(),
                self.compile_limits.clone(),
                StdinSource::Buffer(Vec::new()),
                None,
                None,
                self.cancel.subscribe(),
            )
            .await;

            let succeeded = compile.is_success();
            result.compile = Some(compile);
            if !succeeded {
                self.state = JobState::Done;
                return Ok(result);
            }
        }

        if self.is_canceled() {
            self.state = JobState::Done;
            return Ok(result);
        }

        let mut run_argv = vec![self.entry_basename()];
        run_argv.extend(self.args.iter().cloned());

        let run = phase::run_phase(
            &self.runtime,
            &self.alias,
            slot,
            Stage::Run,
            run_argv,
            self.run_limits.clone(),
            StdinSource::Buffer(self.stdin.clone()),
            None,
            None,
            self.cancel.subscribe(),
        )
        .await;

        result.run = Some(run);
        self.state = JobState::Done;
        Ok(result)
    }
}
