//! Interactive execution
//!
//! Same phase sequence as batch mode, but wired through an [`EventBus`]:
//! output streams out as it is read, stdin streams in from the client, and
//! client signal requests land on whichever phase is currently running.
//!
//! Event ordering per phase is `stage`, then data, then `exit`; nothing is
//! published after the final `Completed`.

use tokio::sync::{broadcast, mpsc};
use tracing::instrument;

use crate::bus::{EventBus, JobEvent};
use crate::job::{Job, JobError, JobState, phase};
use crate::supervisor::{OutputChunk, StdinSource};
use crate::types::{JobResult, PhaseResult, Stage};

impl Job {
    /// Run both phases, streaming events through `bus`.
    #[instrument(skip(self, bus), fields(language = %self.runtime.language))]
    pub async fn execute_interactive(&mut self, bus: &EventBus) -> Result<JobResult, JobError> {
        self.expect_state("execute_interactive", JobState::Primed)?;
        self.state = JobState::Executing;

        let slot = self.slot_ref()?;
        let mut result = JobResult {
            language: self.runtime.language.clone(),
            version: self.runtime.version.to_string(),
            compile: None,
            run: None,
        };

        // One signal channel serves both phases; whichever phase is live
        // receives the deliveries.
        let mut signals = bus.take_signals();

        if self.runtime.is_compiled() {
            bus.publish(JobEvent::Stage {
                stage: Stage::Compile,
            });

            let (chunk_tx, forwarder) = forward_output(bus.event_sender());
            let compile = phase::run_phase(
                &self.runtime,
                &self.alias,
                slot,
                Stage::Compile,
                self.file_basenames(),
                self.compile_limits.clone(),
                StdinSource::Buffer(Vec::new()),
                Some(chunk_tx),
                signals.as_mut(),
                self.cancel.subscribe(),
            )
            .await;
            // All data events flush before the exit event goes out.
            let _ = forwarder.await;

            publish_exit(bus, Stage::Compile, &compile);
            let succeeded = compile.is_success();
            result.compile = Some(compile);

            if !succeeded {
                bus.publish(JobEvent::Completed);
                self.state = JobState::Done;
                return Ok(result);
            }
        }

        if self.is_canceled() {
            bus.publish(JobEvent::Completed);
            self.state = JobState::Done;
            return Ok(result);
        }

        bus.publish(JobEvent::Stage { stage: Stage::Run });

        let stdin = match bus.take_stdin() {
            Some(rx) => StdinSource::Channel(rx),
            // The transport already consumed the channel; run with no input.
            None => StdinSource::Buffer(Vec::new()),
        };

        let mut run_argv = vec![self.entry_basename()];
        run_argv.extend(self.args.iter().cloned());

        let (chunk_tx, forwarder) = forward_output(bus.event_sender());
        let run = phase::run_phase(
            &self.runtime,
            &self.alias,
            slot,
            Stage::Run,
            run_argv,
            self.run_limits.clone(),
            stdin,
            Some(chunk_tx),
            signals.as_mut(),
            self.cancel.subscribe(),
        )
        .await;
        let _ = forwarder.await;

        publish_exit(bus, Stage::Run, &run);
        result.run = Some(run);

        bus.publish(JobEvent::Completed);
        self.state = JobState::Done;
        Ok(result)
    }
}

/// Spawn a task republishing supervisor output chunks as bus data events.
///
/// The task ends when the supervisor drops its sender, so awaiting the
/// handle is the barrier that keeps `exit` after all data.
fn forward_output(
    events: broadcast::Sender<JobEvent>,
) -> (
    mpsc::UnboundedSender<OutputChunk>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();
    let handle = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let _ = events.send(JobEvent::Data {
                stream: chunk.stream,
                data: chunk.data,
            });
        }
    });
    (tx, handle)
}

fn publish_exit(bus: &EventBus, stage: Stage, result: &PhaseResult) {
    bus.publish(JobEvent::Exit {
        stage,
        exit_code: result.exit_code,
        signal: result.signal.clone(),
    });
}
