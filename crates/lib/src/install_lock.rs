//! Advisory per-prefix install lock.
//!
//! Two runs installing into the same prefix serialize on an exclusive `flock`
//! held on `<locks_dir>/<hash of prefix>.lock`. The prefix itself is never
//! touched by locking. The lock file records who holds it so a blocked run can
//! say what it is waiting for.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Delay between lock attempts while another run holds the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  /// What holds the lock, usually `<name>-<version>`.
  pub holder: String,
  pub prefix: PathBuf,
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error(
    "timed out after {waited:?} waiting for install lock on {prefix} (held by {holder}, PID {pid})\n\
     If no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  Contention {
    prefix: PathBuf,
    holder: String,
    pid: u32,
    waited: Duration,
    lock_path: PathBuf,
  },

  #[error(
    "timed out after {waited:?} waiting for install lock on {prefix}\n\
     If no kiln process is running, remove the lock file:\n  {lock_path}"
  )]
  ContentionUnknown {
    prefix: PathBuf,
    waited: Duration,
    lock_path: PathBuf,
  },

  #[error("cancelled while waiting for install lock on {0}")]
  Cancelled(PathBuf),

  #[error("failed to create lock directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to open lock file: {0}")]
  OpenFile(#[source] io::Error),

  #[error("failed to write lock metadata: {0}")]
  WriteMetadata(#[source] io::Error),

  #[error("failed to acquire lock: {0}")]
  LockFailed(#[source] io::Error),
}

/// Held install lock. Released on drop.
#[derive(Debug)]
pub struct InstallLock {
  file: File,
  lock_path: PathBuf,
}

impl InstallLock {
  /// Lock file for `prefix` inside `locks_dir`.
  ///
  /// Every spelling of the same directory maps to the same file: the prefix
  /// is keyed by [`lock_key`], not by its raw bytes.
  pub fn lock_path_for(locks_dir: &Path, prefix: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(lock_key(prefix).as_os_str().as_encoded_bytes());
    locks_dir.join(format!("{}.lock", &hex::encode(hasher.finalize())[..32]))
  }

  /// Single non-blocking attempt. `Ok(None)` when another process holds the lock.
  pub fn try_acquire(locks_dir: &Path, prefix: &Path, holder: &str) -> Result<Option<Self>, LockError> {
    std::fs::create_dir_all(locks_dir).map_err(LockError::CreateDir)?;
    let lock_path = Self::lock_path_for(locks_dir, prefix);

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(LockError::OpenFile)?;

    if let Err(err) = try_lock(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(None);
      }
      return Err(LockError::LockFailed(err));
    }

    write_metadata(&file, holder, prefix)?;
    Ok(Some(InstallLock { file, lock_path }))
  }

  /// Wait for the lock, polling until `timeout` elapses or `cancel` fires.
  pub async fn acquire(
    locks_dir: &Path,
    prefix: &Path,
    holder: &str,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<Self, LockError> {
    let started = Instant::now();
    let mut logged = false;

    loop {
      if let Some(lock) = Self::try_acquire(locks_dir, prefix, holder)? {
        debug!(prefix = ?prefix, lock = ?lock.lock_path, waited = ?started.elapsed(), "install lock acquired");
        return Ok(lock);
      }

      let lock_path = Self::lock_path_for(locks_dir, prefix);
      if !logged {
        let by = read_holder(&lock_path).map(|m| m.holder).unwrap_or_else(|| "unknown".to_string());
        info!(prefix = ?prefix, holder = %by, "waiting for install lock");
        logged = true;
      }

      let waited = started.elapsed();
      if waited >= timeout {
        return Err(contention_error(&lock_path, prefix, waited));
      }

      tokio::select! {
        _ = cancel.cancelled() => return Err(LockError::Cancelled(prefix.to_path_buf())),
        _ = tokio::time::sleep(POLL_INTERVAL.min(timeout - waited)) => {}
      }
    }
  }

  /// Read the metadata through the held handle.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

/// Normalized form of `prefix`.
///
/// Trailing separators and `.` segments are dropped, then the deepest existing
/// ancestor is resolved so `..` and symlinks in the part that already exists
/// collapse to one path. The prefix itself usually does not exist yet.
fn lock_key(prefix: &Path) -> PathBuf {
  let lexical: PathBuf = prefix.components().collect();
  for ancestor in lexical.ancestors() {
    if let Ok(resolved) = std::fs::canonicalize(ancestor)
      && let Ok(rest) = lexical.strip_prefix(ancestor)
    {
      return resolved.join(rest).components().collect();
    }
  }
  lexical
}

fn write_metadata(file: &File, holder: &str, prefix: &Path) -> Result<(), LockError> {
  let metadata = LockMetadata {
    version: 1,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    holder: holder.to_string(),
    prefix: prefix.to_path_buf(),
  };

  file.set_len(0).map_err(LockError::WriteMetadata)?;
  let mut writer = io::BufWriter::new(file);
  writer.seek(SeekFrom::Start(0)).map_err(LockError::WriteMetadata)?;
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(|e| LockError::WriteMetadata(io::Error::other(e)))?;
  writer.flush().map_err(LockError::WriteMetadata)?;
  Ok(())
}

fn read_holder(lock_path: &Path) -> Option<LockMetadata> {
  let mut contents = String::new();
  File::open(lock_path).ok()?.read_to_string(&mut contents).ok()?;
  serde_json::from_str(&contents).ok()
}

fn contention_error(lock_path: &Path, prefix: &Path, waited: Duration) -> LockError {
  match read_holder(lock_path) {
    Some(metadata) => LockError::Contention {
      prefix: prefix.to_path_buf(),
      holder: metadata.holder,
      pid: metadata.pid,
      waited,
      lock_path: lock_path.to_path_buf(),
    },
    None => LockError::ContentionUnknown {
      prefix: prefix.to_path_buf(),
      waited,
      lock_path: lock_path.to_path_buf(),
    },
  }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
fn try_lock(file: &File) -> io::Result<()> {
  match file.try_lock() {
    Ok(()) => Ok(()),
    Err(std::fs::TryLockError::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
    Err(std::fs::TryLockError::Error(e)) => Err(e),
  }
}
