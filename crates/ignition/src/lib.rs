//! A multi-tenant sandboxed code execution engine.
//!
//! Ignition takes a bundle of source files in a named language and version,
//! compiles and runs it inside an isolated sandbox slot, and returns or
//! streams the output of both phases. Isolation is uid-based: each slot
//! owns a dedicated uid/gid pair and a scratch directory, and every child
//! runs in its own process group under kernel rlimits.
//!
//! # Features
//!
//! - **Runtime registry** — (language, version) lookup with aliases and
//!   highest-version-wins matching over a scanned packages directory.
//! - **Slot pool** — leased sandbox slots with leftover-process sweep and
//!   scratch-directory reset on release.
//! - **Process supervisor** — wall-clock watchdog, capped output capture,
//!   stdin injection, and allow-listed signal delivery per phase.
//! - **Batch and interactive jobs** — one-shot execution or live streaming
//!   through a per-job event bus.
//! - **Concurrency governor** — per-client and global live-job caps.

pub use api::{ClientMessage, ExecuteRequest, ExecuteResponse, ServerMessage};
pub use bus::{BusError, EventBus, JobEvent};
pub use config::{Config, EXAMPLE_CONFIG};
pub use engine::{Engine, EngineError};
pub use governor::{Governor, GovernorError, Ticket};
pub use job::{Job, JobError, JobRequest, JobState, KillHandle, SourceFile};
pub use registry::{Registry, RegistryError, Runtime, Version};
pub use sandbox::{SandboxError, Slot, SlotPool};
pub use types::{JobResult, PhaseResult, ResourceLimits, Stage, StreamKind};

pub mod api;
pub mod bus;
pub mod config;
pub mod engine;
pub mod governor;
pub mod job;
pub mod registry;
pub mod sandbox;
pub mod supervisor;
pub mod types;
