//! Single-phase execution
//!
//! Shared by batch and interactive mode: build the process spec for a
//! compile or run script and hand it to the supervisor.

use std::path::Path;

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::registry::Runtime;
use crate::sandbox::Slot;
use crate::supervisor::{self, OutputChunk, PhaseIo, ProcessLimits, ProcessSpec, StdinSource};
use crate::types::{PhaseResult, Stage};

/// Run one phase of a job inside its slot.
///
/// A script that cannot be launched comes back as a launch-failure
/// [`PhaseResult`], not an error; the job completes normally around it.
#[allow(clippy::too_many_arguments)]
pub(super) async fn run_phase(
    runtime: &Runtime,
    alias: &str,
    slot: &Slot,
    stage: Stage,
    argv_tail: Vec<String>,
    limits: ProcessLimits,
    stdin: StdinSource,
    events: Option<mpsc::UnboundedSender<OutputChunk>>,
    signals: Option<&mut mpsc::Receiver<Signal>>,
    cancel: watch::Receiver<bool>,
) -> PhaseResult {
    let script: &Path = match stage {
        Stage::Compile => match runtime.compile_script.as_deref() {
            Some(script) => script,
            None => {
                // Callers only request a compile phase for compiled
                // runtimes; reaching this is a wiring bug, reported the
                // same way as any other launch problem.
                return PhaseResult::launch_failure(format!(
                    "runtime {} has no compile script",
                    runtime.language
                ));
            }
        },
        Stage::Run => &runtime.run_script,
    };

    let mut argv = Vec::with_capacity(argv_tail.len() + 1);
    argv.push(stage.to_string());
    argv.extend(argv_tail);

    debug!(%stage, ?argv, slot = slot.id(), "starting phase");

    let spec = ProcessSpec {
        program: script.to_owned(),
        argv,
        cwd: slot.dir().to_owned(),
        env: runtime.phase_env(alias, slot.dir()),
        uid: slot.uid(),
        gid: slot.gid(),
    };

    let io = PhaseIo {
        events,
        signals,
        cancel: Some(cancel),
    };

    supervisor::supervise(spec, limits, stdin, io).await
}
