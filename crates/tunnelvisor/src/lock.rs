//! Per-tunnel advisory lock held for the whole of a start, stop, restart or purge.
//!
//! Uses `flock(2)` on `{state_dir}/{prefix}-{name}.lock`. The file is only
//! unlinked by its holder ([`TunnelLock::remove`]); anyone who locked the
//! unlinked inode notices it is no longer at the path and retries on the
//! fresh file, so there is never more than one holder per name.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use tunnelvisor_core::{Result, SupervisorError};

pub struct TunnelLock {
    path: PathBuf,
    _guard: Flock<File>,
}

impl TunnelLock {
    /// Block (on a worker thread) until the lock is ours
    pub async fn acquire(path: PathBuf) -> Result<Self> {
        let lock_path = path.clone();
        tokio::task::spawn_blocking(move || Self::lock(path, FlockArg::LockExclusive))
            .await
            .map_err(anyhow::Error::from)??
            .ok_or_else(|| SupervisorError::storage(lock_path, Errno::EWOULDBLOCK.into()))
    }

    /// Take the lock only if nobody else holds it
    pub fn try_acquire(path: PathBuf) -> Result<Option<Self>> {
        Self::lock(path, FlockArg::LockExclusiveNonblock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file and release the lock
    pub async fn remove(self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!("Removed lock file: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SupervisorError::storage(&self.path, e)),
        }
    }

    fn lock(path: PathBuf, arg: FlockArg) -> Result<Option<Self>> {
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| SupervisorError::storage(&path, e))?;

            let guard = match Flock::lock(file, arg) {
                Ok(guard) => guard,
                Err((_, Errno::EWOULDBLOCK)) => {
                    debug!("Lock held by another process: {}", path.display());
                    return Ok(None);
                }
                Err((_, errno)) => return Err(SupervisorError::storage(&path, errno.into())),
            };

            if is_current(&path, &guard)? {
                debug!("Lock acquired: {}", path.display());
                return Ok(Some(Self {
                    path,
                    _guard: guard,
                }));
            }
            debug!("Lock file was removed while waiting, retrying: {}", path.display());
        }
    }
}

/// Whether `file` is still the inode linked at `path`
fn is_current(path: &Path, file: &File) -> Result<bool> {
    let held = file
        .metadata()
        .map_err(|e| SupervisorError::storage(path, e))?;
    match std::fs::metadata(path) {
        Ok(linked) => Ok(held.dev() == linked.dev() && held.ino() == linked.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SupervisorError::storage(path, e)),
    }
}

impl Drop for TunnelLock {
    fn drop(&mut self) {
        debug!("Lock released: {}", self.path.display());
    }
}
