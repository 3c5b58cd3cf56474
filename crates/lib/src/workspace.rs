//! Per-run scratch directory.
//!
//! Every pipeline run gets a fresh directory under the work root:
//!
//! ```text
//! <work_dir>/<name>-<version>-XXXXXX/
//! ├── src/    # extracted source, build runs here
//! ├── home/   # HOME for build and test commands
//! └── tmp/    # TMPDIR for build and test commands
//! ```
//!
//! The directory is removed when the [`Workspace`] is dropped unless
//! [`Workspace::keep`] was called.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::extract::{ExtractError, extract};

#[derive(Debug)]
pub struct Workspace {
  dir: TempDir,
  source_root: Option<PathBuf>,
}

impl Workspace {
  /// Create a workspace for `label` inside `work_root`.
  pub fn create(work_root: &Path, label: &str) -> io::Result<Self> {
    std::fs::create_dir_all(work_root)?;
    let dir = tempfile::Builder::new()
      .prefix(&format!("{label}-"))
      .tempdir_in(work_root)?;

    for sub in ["src", "home", "tmp"] {
      std::fs::create_dir(dir.path().join(sub))?;
    }

    debug!(path = ?dir.path(), "created workspace");
    Ok(Self { dir, source_root: None })
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  pub fn src_dir(&self) -> PathBuf {
    self.dir.path().join("src")
  }

  pub fn home_dir(&self) -> PathBuf {
    self.dir.path().join("home")
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.dir.path().join("tmp")
  }

  /// Where the build runs. `None` until [`Workspace::unpack`] succeeded.
  pub fn source_root(&self) -> Option<&Path> {
    self.source_root.as_deref()
  }

  /// Extract verified source bytes into `src/` on the blocking pool.
  pub async fn unpack(&mut self, bytes: Vec<u8>, file_name: String) -> Result<PathBuf, ExtractError> {
    let dest = self.src_dir();
    let root = tokio::task::spawn_blocking(move || extract(&bytes, &file_name, &dest))
      .await
      .map_err(|e| ExtractError::Io(io::Error::other(e)))??;
    self.source_root = Some(root.clone());
    Ok(root)
  }

  /// Persist the directory past drop and return its path.
  pub fn keep(self) -> PathBuf {
    self.dir.keep()
  }
}
