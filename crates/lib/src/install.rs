//! Atomic installation of build artifacts into a prefix.
//!
//! # Procedure
//!
//! 1. Check every artifact exists and resolves to a regular file inside the
//!    source tree, and that nothing in the prefix blocks its destination.
//!    Nothing is written before this.
//! 2. Copy the artifacts into a hidden staging directory inside the prefix
//!    (same filesystem) and set their modes.
//! 3. Rename each staged file into place. An existing file at the destination
//!    is first renamed aside into the staging directory.
//!
//! Every step is journaled. A failure in step 2 or 3 undoes the journal, so
//! either all artifacts land or the prefix is left as it was. A committed
//! [`Installation`] can still be rolled back until it is finalized, which the
//! pipeline uses when the self-test fails.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::STAGING_DIR_PREFIX;
use crate::error::ErrorKind;
use crate::install_lock::LockError;
use crate::recipe::{ArtifactKind, Recipe};

const EXECUTABLE_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

/// One artifact as it ended up in the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledArtifact {
  pub source_path: PathBuf,
  pub installed_path: PathBuf,
  pub kind: ArtifactKind,
  /// Unix permission bits (0 on other platforms).
  pub mode: u32,
}

#[derive(Debug, Error)]
pub enum InstallError {
  #[error("artifact not found: {0}")]
  MissingArtifact(PathBuf),

  #[error("artifact is not a regular file: {0}")]
  WrongType(PathBuf),

  #[error("artifact {path} resolves outside the source tree to {target}")]
  OutsideSourceTree { path: PathBuf, target: PathBuf },

  #[error("permission denied: {path}")]
  PermissionDenied {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot install to {path}: {reason}")]
  PathConflict { path: PathBuf, reason: String },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("install failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl InstallError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      InstallError::MissingArtifact(_) => ErrorKind::MissingArtifact,
      InstallError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
      InstallError::PathConflict { .. } => ErrorKind::PathConflict,
      InstallError::Lock(LockError::Cancelled(_)) => ErrorKind::Cancelled,
      InstallError::WrongType(_)
      | InstallError::OutsideSourceTree { .. }
      | InstallError::Lock(_)
      | InstallError::Io { .. } => ErrorKind::InstallFailed,
    }
  }
}

fn io_error(path: &Path, source: io::Error) -> InstallError {
  if source.kind() == io::ErrorKind::PermissionDenied {
    InstallError::PermissionDenied {
      path: path.to_path_buf(),
      source,
    }
  } else {
    InstallError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// A checked artifact waiting to be staged.
struct Planned {
  source: PathBuf,
  /// `source` with every symlink resolved; this is what gets copied.
  resolved: PathBuf,
  dest: PathBuf,
  kind: ArtifactKind,
}

#[derive(Debug)]
enum Step {
  /// A staged file was renamed to this destination.
  Placed(PathBuf),
  /// An existing file was moved from `original` to `backup`.
  Displaced { original: PathBuf, backup: PathBuf },
}

/// Undo log for one install.
#[derive(Debug, Default)]
struct Journal {
  steps: Vec<Step>,
  created_dirs: Vec<PathBuf>,
}

impl Journal {
  /// `create_dir_all` that records each directory it creates.
  fn create_dirs(&mut self, dir: &Path) -> Result<(), InstallError> {
    let mut missing = Vec::new();
    let mut current = Some(dir);
    while let Some(path) = current {
      if path.is_dir() {
        break;
      }
      missing.push(path.to_path_buf());
      current = path.parent();
    }
    for path in missing.into_iter().rev() {
      match fs::create_dir(&path) {
        Ok(()) => self.created_dirs.push(path),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
        Err(e) => return Err(io_error(&path, e)),
      }
    }
    Ok(())
  }

  /// Undo file moves, then remove `staging`, then remove created directories.
  fn undo(&mut self, staging: Option<TempDir>) {
    for step in self.steps.drain(..).rev() {
      let result = match &step {
        Step::Placed(dest) => fs::remove_file(dest),
        Step::Displaced { original, backup } => fs::rename(backup, original),
      };
      if let Err(e) = result {
        warn!(step = ?step, error = %e, "rollback step failed");
      }
    }

    if let Some(staging) = staging {
      let path = staging.path().to_path_buf();
      if let Err(e) = staging.close() {
        warn!(path = ?path, error = %e, "failed to remove staging directory");
      }
    }

    for dir in self.created_dirs.drain(..).rev() {
      // Only succeeds when empty, which is what we want.
      if fs::remove_dir(&dir).is_err() {
        debug!(dir = ?dir, "leaving non-empty directory in place");
      }
    }
  }
}

/// Copies declared artifacts into an install prefix all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct InstallStager;

impl InstallStager {
  pub fn new() -> Self {
    Self
  }

  /// Install `recipe`'s artifacts from `source_root` into its prefix.
  pub fn install(&self, recipe: &Recipe, source_root: &Path) -> Result<Installation, InstallError> {
    let prefix = recipe.install_prefix.as_path();
    let plan = plan(recipe, source_root)?;

    let mut journal = Journal::default();
    match stage_and_commit(&plan, prefix, &mut journal) {
      Ok((staging, artifacts)) => {
        info!(prefix = ?prefix, count = artifacts.len(), "artifacts installed");
        Ok(Installation {
          prefix: prefix.to_path_buf(),
          artifacts,
          journal,
          staging: Some(staging),
          done: false,
        })
      }
      Err((staging, err)) => {
        warn!(prefix = ?prefix, error = %err, "install failed, rolling back");
        journal.undo(staging);
        Err(err)
      }
    }
  }
}

fn plan(recipe: &Recipe, source_root: &Path) -> Result<Vec<Planned>, InstallError> {
  let prefix = recipe.install_prefix.as_path();
  let mut planned = Vec::with_capacity(recipe.artifact_paths.len());
  let root = fs::canonicalize(source_root).map_err(|e| io_error(source_root, e))?;

  for artifact in &recipe.artifact_paths {
    let source = source_root.join(&artifact.path);
    let resolved = match fs::canonicalize(&source) {
      Ok(p) => p,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(InstallError::MissingArtifact(source)),
      Err(e) => return Err(io_error(&source, e)),
    };
    if !resolved.starts_with(&root) {
      return Err(InstallError::OutsideSourceTree {
        path: source,
        target: resolved,
      });
    }
    let metadata = fs::symlink_metadata(&resolved).map_err(|e| io_error(&resolved, e))?;
    if !metadata.is_file() {
      return Err(InstallError::WrongType(source));
    }
    if artifact.kind == ArtifactKind::Executable && !is_executable(&metadata) {
      debug!(source = ?source, "promoting non-executable artifact to executable");
    }

    let dest = prefix.join(artifact.destination(&recipe.name));
    check_destination(prefix, &dest)?;

    planned.push(Planned {
      source,
      resolved,
      dest,
      kind: artifact.kind,
    });
  }

  Ok(planned)
}

/// The destination must not be a directory, and no existing ancestor below
/// the prefix may be a non-directory.
fn check_destination(prefix: &Path, dest: &Path) -> Result<(), InstallError> {
  if let Ok(meta) = fs::symlink_metadata(dest)
    && meta.is_dir()
  {
    return Err(InstallError::PathConflict {
      path: dest.to_path_buf(),
      reason: "a directory exists at the destination".to_string(),
    });
  }

  let mut ancestor = dest.parent();
  while let Some(dir) = ancestor {
    if let Ok(meta) = fs::metadata(dir)
      && !meta.is_dir()
    {
      return Err(InstallError::PathConflict {
        path: dest.to_path_buf(),
        reason: format!("{} exists and is not a directory", dir.display()),
      });
    }
    if dir == prefix {
      break;
    }
    ancestor = dir.parent();
  }
  Ok(())
}

type StageFailure = (Option<TempDir>, InstallError);

fn stage_and_commit(
  plan: &[Planned],
  prefix: &Path,
  journal: &mut Journal,
) -> Result<(TempDir, Vec<InstalledArtifact>), StageFailure> {
  journal.create_dirs(prefix).map_err(|e| (None, e))?;

  let staging = tempfile::Builder::new()
    .prefix(STAGING_DIR_PREFIX)
    .tempdir_in(prefix)
    .map_err(|e| (None, io_error(prefix, e)))?;
  debug!(staging = ?staging.path(), "created staging directory");

  match stage_all(plan, staging.path()).and_then(|staged| commit_all(plan, &staged, staging.path(), journal)) {
    Ok(artifacts) => Ok((staging, artifacts)),
    Err(e) => Err((Some(staging), e)),
  }
}

fn stage_all(plan: &[Planned], staging: &Path) -> Result<Vec<PathBuf>, InstallError> {
  plan
    .iter()
    .enumerate()
    .map(|(i, item)| {
      let staged = staging.join(format!("{i}.new"));
      fs::copy(&item.resolved, &staged).map_err(|e| io_error(&item.source, e))?;
      set_mode(&staged, mode_for(item.kind)).map_err(|e| io_error(&staged, e))?;
      Ok(staged)
    })
    .collect()
}

fn commit_all(
  plan: &[Planned],
  staged: &[PathBuf],
  staging: &Path,
  journal: &mut Journal,
) -> Result<Vec<InstalledArtifact>, InstallError> {
  let mut installed = Vec::with_capacity(plan.len());

  for (i, (item, staged)) in plan.iter().zip(staged).enumerate() {
    if let Some(parent) = item.dest.parent() {
      journal.create_dirs(parent)?;
    }

    if fs::symlink_metadata(&item.dest).is_ok() {
      let backup = staging.join(format!("{i}.old"));
      fs::rename(&item.dest, &backup).map_err(|e| io_error(&item.dest, e))?;
      journal.steps.push(Step::Displaced {
        original: item.dest.clone(),
        backup,
      });
    }

    fs::rename(staged, &item.dest).map_err(|e| io_error(&item.dest, e))?;
    journal.steps.push(Step::Placed(item.dest.clone()));
    debug!(source = ?item.source, dest = ?item.dest, "installed artifact");

    installed.push(InstalledArtifact {
      source_path: item.source.clone(),
      installed_path: item.dest.clone(),
      kind: item.kind,
      mode: mode_for(item.kind),
    });
  }

  Ok(installed)
}

fn mode_for(kind: ArtifactKind) -> u32 {
  match kind {
    ArtifactKind::Executable => EXECUTABLE_MODE,
    ArtifactKind::File => FILE_MODE,
  }
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
  true
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
  Ok(())
}

/// A committed install that can still be undone.
///
/// Dropping an `Installation` that was neither finalized nor rolled back
/// rolls it back.
#[derive(Debug)]
pub struct Installation {
  prefix: PathBuf,
  artifacts: Vec<InstalledArtifact>,
  journal: Journal,
  staging: Option<TempDir>,
  done: bool,
}

impl Installation {
  pub fn prefix(&self) -> &Path {
    &self.prefix
  }

  pub fn artifacts(&self) -> &[InstalledArtifact] {
    &self.artifacts
  }

  /// Keep the installed files and discard any displaced ones.
  pub fn finalize(mut self) -> Vec<InstalledArtifact> {
    self.done = true;
    if let Some(staging) = self.staging.take() {
      let path = staging.path().to_path_buf();
      if let Err(e) = staging.close() {
        warn!(path = ?path, error = %e, "failed to remove staging directory");
      }
    }
    std::mem::take(&mut self.artifacts)
  }

  /// Remove installed files and restore whatever they replaced.
  pub fn rollback(mut self) {
    self.undo();
  }

  fn undo(&mut self) {
    self.done = true;
    info!(prefix = ?self.prefix, "rolling back installation");
    let staging = self.staging.take();
    self.journal.undo(staging);
  }
}

impl Drop for Installation {
  fn drop(&mut self) {
    if !self.done {
      self.undo();
    }
  }
}
