//! Sandbox slot pool
//!
//! Isolation here is uid-based: every slot owns a dedicated uid/gid pair and
//! a scratch directory only that uid can read. A child running as slot 3's
//! uid cannot open slot 4's files and cannot signal slot 4's processes,
//! which is the whole containment story.
//!
//! Without root the engine cannot switch uids; the pool then falls back to
//! running children under its own uid. Scratch-directory lifecycle and the
//! slot lease discipline still apply, only the inter-slot wall is gone.

use std::path::PathBuf;

use thiserror::Error;

pub use crate::sandbox::pool::SlotPool;
pub use crate::sandbox::slot::Slot;

mod pool;
mod slot;

/// Errors that occur during sandbox slot operations
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no free sandbox slot")]
    Exhausted,

    #[error("invalid staging path: {0}")]
    InvalidPath(String),

    #[error("failed to prepare slot {id}: {source}")]
    Prepare {
        id: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to change ownership of {path}: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
