//! Per-job event bus
//!
//! A small pub/sub hub local to one interactive job. The job publishes
//! stage/data/exit events outbound; the transport pushes stdin chunks and
//! signal requests inbound. Keeping the hub in the middle means the engine
//! never learns what the transport is — a WebSocket handler and a test both
//! just subscribe and push.
//!
//! Outbound delivery uses a broadcast channel: every subscriber sees events
//! in publish order, and subscribers that join late do not get a replay.
//! The inbound stdin channel is bounded, so a client that floods stdin
//! faster than the child reads gets backpressure instead of unbounded
//! buffering.

use nix::sys::signal::Signal;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::supervisor::parse_signal;
use crate::types::{Stage, StreamKind};

/// Outbound event capacity; a slow subscriber past this lags (broadcast
/// semantics) rather than stalling the job
const EVENT_CAPACITY: usize = 256;

/// Inbound stdin chunk capacity before the producer blocks
const STDIN_CAPACITY: usize = 64;

/// Inbound signal request capacity
const SIGNAL_CAPACITY: usize = 16;

/// Errors surfaced to the transport pushing into the bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown or disallowed signal '{0}'")]
    InvalidSignal(String),

    #[error("session closed")]
    Closed,
}

/// Events a job publishes while executing interactively
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// A phase is starting
    Stage { stage: Stage },

    /// A chunk of child output
    Data { stream: StreamKind, data: Vec<u8> },

    /// A phase finished
    Exit {
        stage: Stage,
        exit_code: Option<i32>,
        signal: Option<String>,
    },

    /// The job is done; no further events will be published
    Completed,
}

/// Pub/sub hub for one interactive job
#[derive(Debug)]
pub struct EventBus {
    events: broadcast::Sender<JobEvent>,

    stdin_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    stdin_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,

    signal_tx: mpsc::Sender<Signal>,
    signal_rx: Mutex<Option<mpsc::Receiver<Signal>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        Self {
            events,
            stdin_tx: Mutex::new(Some(stdin_tx)),
            stdin_rx: Mutex::new(Some(stdin_rx)),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    /// Subscribe to outbound events. Events published before the
    /// subscription are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Publish an outbound event. A bus with no subscribers swallows it.
    pub(crate) fn publish(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    /// Clone of the outbound sender, for tasks that publish on the job's
    /// behalf
    pub(crate) fn event_sender(&self) -> broadcast::Sender<JobEvent> {
        self.events.clone()
    }

    /// Push a chunk of stdin toward the running child.
    ///
    /// Applies backpressure when the in-flight buffer is full.
    pub async fn push_stdin(&self, data: Vec<u8>) -> Result<(), BusError> {
        // Clone the sender out so the lock is not held across the send.
        let tx = self
            .stdin_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match tx {
            Some(tx) => tx.send(data).await.map_err(|_| BusError::Closed),
            None => Err(BusError::Closed),
        }
    }

    /// Signal end of input; the child's stdin pipe closes once buffered
    /// chunks have been written
    pub fn close_stdin(&self) {
        self.stdin_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Request signal delivery to the current phase.
    ///
    /// The name is validated against the POSIX allow-list before anything is
    /// sent.
    pub async fn push_signal(&self, name: &str) -> Result<(), BusError> {
        let signal =
            parse_signal(name).ok_or_else(|| BusError::InvalidSignal(name.to_owned()))?;
        self.signal_tx
            .send(signal)
            .await
            .map_err(|_| BusError::Closed)
    }

    /// Take the stdin receiver for wiring into the run phase. First caller
    /// wins; the job takes it once.
    pub(crate) fn take_stdin(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.stdin_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Take the signal receiver, shared across both phases of the job
    pub(crate) fn take_signals(&self) -> Option<mpsc::Receiver<Signal>> {
        self.signal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
