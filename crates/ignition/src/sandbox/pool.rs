//! Slot pool lifecycle
//!
//! Slots are leased with `acquire` and returned with `release`. Acquisition
//! is non-blocking: a caller that finds the pool empty gets
//! [`SandboxError::Exhausted`] immediately and may retry later. Release is
//! best-effort and never fails — it sweeps leftover processes, empties the
//! scratch directory, and puts the slot id back on the free list.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{Gid, Pid, Uid};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::sandbox::{SandboxError, Slot};

/// Attempts at killing leftover processes before giving up
const SWEEP_ATTEMPTS: u32 = 5;

/// Attempts at emptying a scratch directory that reports EBUSY
const CLEAR_ATTEMPTS: u32 = 5;

/// Pool of sandbox slots, one concurrent job per slot
#[derive(Debug)]
pub struct SlotPool {
    root: PathBuf,
    count: u32,
    base_uid: u32,
    base_gid: u32,

    /// Whether the engine can switch uids (running as root)
    privileged: bool,

    /// Free slot ids; guarded separately from the permits so ids can be
    /// handed out in any order
    free: Mutex<Vec<u32>>,

    semaphore: Arc<Semaphore>,
}

impl SlotPool {
    /// Create a pool of `count` slots rooted at `root`.
    ///
    /// Slot N runs as `base_uid + N` / `base_gid + N` when the process is
    /// privileged; otherwise children share the engine's own uid and only
    /// the directory lifecycle is enforced.
    pub fn new(root: impl Into<PathBuf>, count: u32, base_uid: u32, base_gid: u32) -> Self {
        let privileged = Uid::effective().is_root();
        if !privileged {
            warn!(
                "not running as root; sandbox children will share this process's uid \
                 and inter-slot isolation is disabled"
            );
        }

        Self {
            root: root.into(),
            count,
            base_uid,
            base_gid,
            privileged,
            free: Mutex::new((0..count).rev().collect()),
            semaphore: Arc::new(Semaphore::new(count as usize)),
        }
    }

    /// Lease a free slot, preparing its scratch directory.
    #[instrument(skip(self))]
    pub async fn acquire(&self) -> Result<Slot, SandboxError> {
        let permit = Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| SandboxError::Exhausted)?;

        let id = {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };
        // A held permit guarantees a free id.
        let Some(id) = id else {
            return Err(SandboxError::Exhausted);
        };

        let dir = self.slot_dir(id);
        if let Err(source) = self.prepare_dir(id, &dir).await {
            self.push_free(id);
            return Err(source);
        }

        debug!(id, dir = %dir.display(), "acquired slot");

        let (uid, gid) = if self.privileged {
            (Some(self.base_uid + id), Some(self.base_gid + id))
        } else {
            (None, None)
        };

        Ok(Slot::new(id, uid, gid, dir, permit))
    }

    /// Return a slot to the pool.
    ///
    /// Kills any process still running under the slot uid and empties the
    /// scratch directory. Failures are logged, never raised: a slot must go
    /// back on the free list no matter what state its last job left behind.
    #[instrument(skip(self, slot), fields(id = slot.id()))]
    pub async fn release(&self, slot: Slot) {
        if self.privileged
            && let Some(uid) = slot.uid()
        {
            sweep_uid_processes(uid).await;
        }

        clear_dir(slot.dir()).await;

        debug!(id = slot.id(), "released slot");
        self.push_free(slot.id());
        // Dropping the slot releases the permit.
    }

    /// Number of slots currently free
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Total number of slots in the pool
    pub fn capacity(&self) -> u32 {
        self.count
    }

    /// Whether uid switching is active
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn slot_dir(&self, id: u32) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn push_free(&self, id: u32) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(id);
    }

    async fn prepare_dir(&self, id: u32, dir: &Path) -> Result<(), SandboxError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| SandboxError::Prepare { id, source })?;
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .await
            .map_err(|source| SandboxError::Prepare { id, source })?;

        if self.privileged {
            let uid = Uid::from_raw(self.base_uid + id);
            let gid = Gid::from_raw(self.base_gid + id);
            nix::unistd::chown(dir, Some(uid), Some(gid)).map_err(|source| {
                SandboxError::Chown {
                    path: dir.to_owned(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

/// SIGKILL every process owned by `uid`, retrying until none remain.
async fn sweep_uid_processes(uid: u32) {
    for _ in 0..SWEEP_ATTEMPTS {
        let pids = uid_processes(uid);
        if pids.is_empty() {
            return;
        }
        for pid in pids {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    if !uid_processes(uid).is_empty() {
        warn!(uid, "processes survived the release sweep");
    }
}

/// List pids whose /proc entry is owned by `uid`
fn uid_processes(uid: u32) -> Vec<i32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<i32>().ok()?;
            let meta = entry.metadata().ok()?;
            (meta.uid() == uid).then_some(pid)
        })
        .collect()
}

/// Empty a scratch directory, tolerating transient EBUSY from lingering
/// mounts or open files.
async fn clear_dir(dir: &Path) {
    for attempt in 0..CLEAR_ATTEMPTS {
        match try_clear(dir) {
            Ok(()) => return,
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                debug!(dir = %dir.display(), attempt, "scratch directory busy, retrying");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "failed to empty scratch directory");
                return;
            }
        }
    }
    warn!(dir = %dir.display(), "scratch directory still busy after retries");
}

fn try_clear(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release_cycle() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(tmp.path(), 2, 1500, 1500);

        assert_eq!(pool.capacity(), 2);
        assert_eq!(pool.available(), 2);

        let slot = pool.acquire().await.unwrap();
        assert!(slot.dir().is_dir());
        assert_eq!(pool.available(), 1);

        pool.release(slot).await;
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn acquire_exhaustion_is_immediate() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(tmp.path(), 1, 1500, 1500);

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, SandboxError::Exhausted));

        pool.release(held).await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn release_empties_scratch_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(tmp.path(), 1, 1500, 1500);

        let slot = pool.acquire().await.unwrap();
        slot.stage_file("junk.txt", b"junk", false).await.unwrap();
        slot.stage_file("deep/nested.txt", b"junk", false)
            .await
            .unwrap();
        let dir = slot.dir().to_owned();

        pool.release(slot).await;
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn slot_ids_are_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(tmp.path(), 1, 1500, 1500);

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        pool.release(first).await;

        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        pool.release(second).await;
    }

    #[tokio::test]
    async fn distinct_slots_get_distinct_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(tmp.path(), 2, 1500, 1500);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.dir(), b.dir());

        pool.release(a).await;
        pool.release(b).await;
    }
}
