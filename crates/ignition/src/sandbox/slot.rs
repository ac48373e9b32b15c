//! A leased sandbox slot
//!
//! The slot handle is a move-only value: the pool hands it to a job at
//! prime time and consumes it again on release. Holding the handle holds the
//! pool permit, so double-release is unrepresentable.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use nix::unistd::{Gid, Uid};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, instrument};

use crate::sandbox::SandboxError;

/// An acquired sandbox slot: a scratch directory plus the uid/gid children
/// run under.
#[derive(Debug)]
pub struct Slot {
    id: u32,

    /// Dedicated uid/gid; None when the pool runs without root
    uid: Option<u32>,
    gid: Option<u32>,

    dir: PathBuf,

    /// Pool permit, released when the slot handle is dropped
    _permit: Option<OwnedSemaphorePermit>,
}

impl Slot {
    pub(super) fn new(
        id: u32,
        uid: Option<u32>,
        gid: Option<u32>,
        dir: PathBuf,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            uid,
            gid,
            dir,
            _permit: Some(permit),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    pub fn gid(&self) -> Option<u32> {
        self.gid
    }

    /// The scratch directory, which is also the working directory of every
    /// supervised child in this slot
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve a request-relative path inside the slot directory.
    ///
    /// Absolute paths and any `..` or `.` component are rejected so a staged
    /// file can never land outside the scratch directory.
    pub fn staged_path(&self, relative: &str) -> Result<PathBuf, SandboxError> {
        if relative.is_empty() {
            return Err(SandboxError::InvalidPath("empty path".to_owned()));
        }
        let path = Path::new(relative);
        for component in path.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(SandboxError::InvalidPath(format!(
                        "path escapes the sandbox: {relative}"
                    )));
                }
            }
        }
        Ok(self.dir.join(path))
    }

    /// Write a request file into the slot, creating parent directories.
    ///
    /// The file (and any directories created for it) is chowned to the slot
    /// uid so the supervised child can read it after privileges drop.
    #[instrument(skip(self, content))]
    pub async fn stage_file(
        &self,
        relative: &str,
        content: &[u8],
        executable: bool,
    ) -> Result<(), SandboxError> {
        let path = self.staged_path(relative)?;

        if let Some(parent) = path.parent()
            && parent != self.dir
        {
            tokio::fs::create_dir_all(parent).await?;
            self.chown_created_dirs(relative)?;
        }

        tokio::fs::write(&path, content).await?;

        let mode = if executable { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).await?;
        self.chown(&path)?;

        debug!(?path, len = content.len(), executable, "staged file");
        Ok(())
    }

    fn chown(&self, path: &Path) -> Result<(), SandboxError> {
        let (Some(uid), Some(gid)) = (self.uid, self.gid) else {
            return Ok(());
        };
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(
            |source| SandboxError::Chown {
                path: path.to_owned(),
                source,
            },
        )
    }

    /// Chown every directory component of a just-staged relative path
    fn chown_created_dirs(&self, relative: &str) -> Result<(), SandboxError> {
        let mut dir = self.dir.clone();
        let components: Vec<_> = Path::new(relative).components().collect();
        // The last component is the file itself, handled separately.
        for component in &components[..components.len().saturating_sub(1)] {
            dir.push(component.as_os_str());
            self.chown(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Semaphore;

    use super::*;

    async fn test_slot(dir: PathBuf) -> Slot {
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.try_acquire_owned().unwrap();
        Slot::new(7, None, None, dir, permit)
    }

    #[tokio::test]
    async fn staged_path_accepts_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = test_slot(tmp.path().to_owned()).await;

        assert!(slot.staged_path("main.py").is_ok());
        assert!(slot.staged_path("src/lib/util.py").is_ok());
    }

    #[tokio::test]
    async fn staged_path_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = test_slot(tmp.path().to_owned()).await;

        assert!(slot.staged_path("../escape").is_err());
        assert!(slot.staged_path("foo/../../escape").is_err());
        assert!(slot.staged_path("/etc/passwd").is_err());
        assert!(slot.staged_path("./sneaky").is_err());
        assert!(slot.staged_path("").is_err());
    }

    #[tokio::test]
    async fn stage_file_writes_content_and_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = test_slot(tmp.path().to_owned()).await;

        slot.stage_file("main.py", b"print(1)", false).await.unwrap();

        let path = tmp.path().join("main.py");
        assert_eq!(std::fs::read(&path).unwrap(), b"print(1)");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[tokio::test]
    async fn stage_file_executable_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = test_slot(tmp.path().to_owned()).await;

        slot.stage_file("entry", b"#!/bin/sh\n", true).await.unwrap();

        let mode = std::fs::metadata(tmp.path().join("entry"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn stage_file_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = test_slot(tmp.path().to_owned()).await;

        slot.stage_file("pkg/sub/mod.py", b"x = 1", false)
            .await
            .unwrap();

        assert!(tmp.path().join("pkg/sub/mod.py").is_file());
    }

    #[tokio::test]
    async fn stage_file_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let slot = test_slot(tmp.path().to_owned()).await;

        let err = slot.stage_file("../outside", b"x", false).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidPath(_)));
        assert!(!tmp.path().parent().unwrap().join("outside").exists());
    }
}
