//! Cross-process device reservation via advisory file locks.
//!
//! One lock file per device id under the lock root. The lock is the
//! OS-level `flock`, so a holder dying without cleanup never blocks
//! other processes: the kernel releases the lock with the last open
//! descriptor and only a stale zero-byte file remains, which is
//! expected residue rather than corruption.

use std::{
    fs::OpenOptions,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};

/// Retry policy for [`Topology::reserve`].
///
/// The default mirrors the shared-hardware-pool assumption: poll every
/// 10 seconds with no cutoff, on the premise that the pool eventually
/// frees up and "temporarily unavailable" is never a terminal failure.
///
/// [`Topology::reserve`]: crate::topology::Topology::reserve
#[derive(Debug, Clone)]
pub struct ReserveOptions {
    pub retry_interval: Duration,
    /// Full scan passes to attempt before giving up; `None` retries
    /// forever.
    pub max_attempts: Option<u64>,
}

impl Default for ReserveOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

/// Exclusive hold on one device, alive for the guard's lifetime.
///
/// Dropping the guard unlinks the lock file and releases the lock, so
/// every exit path of a holder, error paths included, frees the device.
#[derive(Debug)]
pub struct ReservationLock {
    // Held only for the flock; released when dropped.
    _lock: Flock<std::fs::File>,
    path: PathBuf,
}

impl ReservationLock {
    /// Attempt a non-blocking exclusive lock on
    /// `<lock_root>/aft_<device_id>`.
    ///
    /// `Ok(None)` means another holder has the device (contention, not
    /// an error). Failure to create or lock the file for any other
    /// reason is fatal: without a working lock root no reservation can
    /// ever be trusted.
    pub fn try_acquire(lock_root: &Path, device_id: &str) -> Result<Option<Self>> {
        let path = lock_root.join(format!("aft_{device_id}"));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o660)
            .open(&path)
            .map_err(|source| Error::LockSystem {
                path: path.clone(),
                source,
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self { _lock: lock, path })),
            Err((_file, nix::errno::Errno::EAGAIN | nix::errno::Errno::EACCES)) => Ok(None),
            Err((_file, errno)) => Err(Error::LockSystem {
                path,
                source: std::io::Error::from(errno),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ReservationLock {
    fn drop(&mut self) {
        // Unlink before the descriptor closes so no other process can
        // observe an unlocked-but-present file from this holder.
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Could not remove lock file {:?}: {e}", self.path);
        }
    }
}
