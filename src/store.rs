//! Exclusive access to the lease snapshot file.
//!
//! Several processes may share one `leases_file`: the long-running daemon
//! and each one-shot command. Every writer holds a [`StoreLock`] from the
//! moment it loads the snapshot until its changes are saved, so no writer
//! ever overwrites leases it did not load.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::clock::{SystemTimeSource, TimeSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::manager::LeaseManager;

/// Advisory exclusive lock guarding a lease snapshot file.
///
/// The lock lives in a sibling `<leases_file>.lock` file and is released on
/// drop. The lock file itself is left in place.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn lock_path<P: AsRef<Path>>(leases_file: P) -> PathBuf {
        let mut name = leases_file.as_ref().as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Waits until no other holder has the lock for `leases_file`.
    pub async fn acquire<P: AsRef<Path>>(leases_file: P) -> Result<Self> {
        let path = Self::lock_path(leases_file);
        tokio::task::spawn_blocking(move || Self::acquire_blocking(path))
            .await
            .map_err(|error| Error::Io(std::io::Error::other(error)))?
    }

    fn acquire_blocking(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.lock_exclusive()?;
        debug!(path = %path.display(), "Acquired lease store lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), "Failed to release lease store lock: {}", error);
        }
    }
}

/// A [`LeaseManager`] loaded from `leases_file` under its [`StoreLock`].
///
/// Changes made through [`manager`](Self::manager) become visible to other
/// processes on [`commit`](Self::commit). Dropping the session without
/// committing discards them. Without a `leases_file` the session is purely
/// in-memory and takes no lock.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use leasewarden::{AddressFamily, Config, LeaseSession, LogSink};
///
/// # async fn example() -> leasewarden::Result<()> {
/// let session = LeaseSession::open(Arc::new(Config::default()), Arc::new(LogSink)).await?;
/// session.manager().assign("00:1A:2B:3C:4D:5E", AddressFamily::V4).await?;
/// session.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct LeaseSession {
    manager: Arc<LeaseManager>,
    _lock: Option<StoreLock>,
}

impl LeaseSession {
    pub async fn open(config: Arc<Config>, sink: Arc<dyn EventSink>) -> Result<Self> {
        Self::open_with_time_source(config, sink, Arc::new(SystemTimeSource)).await
    }

    pub async fn open_with_time_source(
        config: Arc<Config>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let lock = match &config.leases_file {
            Some(path) => Some(StoreLock::acquire(path).await?),
            None => None,
        };
        let manager = LeaseManager::load_with_time_source(config, sink, clock).await?;

        Ok(Self {
            manager: Arc::new(manager),
            _lock: lock,
        })
    }

    pub fn manager(&self) -> &Arc<LeaseManager> {
        &self.manager
    }

    /// Saves every lease, then releases the lock.
    pub async fn commit(self) -> Result<()> {
        self.manager.save().await
    }
}
