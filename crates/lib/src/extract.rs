//! Unpacking verified source bytes into a work directory.
//!
//! Supports:
//! - `.tar.gz` / `.tgz`
//! - `.tar`
//! - `.zip`
//!
//! Anything else is written as a single file. Entries that would land outside
//! the destination are rejected.

use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
  TarGz,
  Tar,
  Zip,
  Plain,
}

impl ArchiveKind {
  pub fn from_file_name(name: &str) -> Self {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
      ArchiveKind::TarGz
    } else if lower.ends_with(".tar") {
      ArchiveKind::Tar
    } else if lower.ends_with(".zip") {
      ArchiveKind::Zip
    } else {
      ArchiveKind::Plain
    }
  }
}

#[derive(Debug, Error)]
pub enum ExtractError {
  #[error("failed to read archive entry: {0}")]
  Io(#[from] io::Error),

  #[error("failed to read zip archive: {0}")]
  Zip(String),

  #[error("archive entry escapes the extraction directory: {0}")]
  UnsafePath(String),
}

/// Unpack `bytes` (named `file_name`) into `dest`.
///
/// Returns the extraction root: the single top-level directory when the
/// archive has exactly one, otherwise `dest` itself.
pub fn extract(bytes: &[u8], file_name: &str, dest: &Path) -> Result<PathBuf, ExtractError> {
  fs::create_dir_all(dest)?;

  let kind = ArchiveKind::from_file_name(file_name);
  debug!(file = %file_name, kind = ?kind, dest = ?dest, "extracting source");

  match kind {
    ArchiveKind::TarGz => unpack_tar(Archive::new(GzDecoder::new(Cursor::new(bytes))), dest)?,
    ArchiveKind::Tar => unpack_tar(Archive::new(Cursor::new(bytes)), dest)?,
    ArchiveKind::Zip => unpack_zip(bytes, dest)?,
    ArchiveKind::Plain => {
      fs::write(dest.join(file_name), bytes)?;
    }
  }

  let root = extraction_root(dest)?;
  info!(root = ?root, "source extracted");
  Ok(root)
}

fn unpack_tar<R: io::Read>(mut archive: Archive<R>, dest: &Path) -> Result<(), ExtractError> {
  archive.set_preserve_permissions(true);
  archive.set_overwrite(true);

  for entry in archive.entries()? {
    let mut entry = entry?;
    let path = entry.path()?.display().to_string();
    if !entry.unpack_in(dest)? {
      return Err(ExtractError::UnsafePath(path));
    }
  }

  Ok(())
}

fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<(), ExtractError> {
  let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::Zip(e.to_string()))?;

  for i in 0..archive.len() {
    let mut file = archive.by_index(i).map_err(|e| ExtractError::Zip(e.to_string()))?;

    let relative = file
      .enclosed_name()
      .ok_or_else(|| ExtractError::UnsafePath(file.name().to_string()))?;
    let dest_path = dest.join(relative);

    if file.is_dir() {
      fs::create_dir_all(&dest_path)?;
      continue;
    }

    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent)?;
    }
    let mut outfile = File::create(&dest_path)?;
    io::copy(&mut file, &mut outfile)?;

    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      if let Some(mode) = file.unix_mode() {
        fs::set_permissions(&dest_path, fs::Permissions::from_mode(mode))?;
      }
    }
  }

  Ok(())
}

fn extraction_root(dest: &Path) -> io::Result<PathBuf> {
  let entries: Vec<_> = fs::read_dir(dest)?.filter_map(|e| e.ok()).collect();
  if entries.len() == 1 && entries[0].file_type().map(|t| t.is_dir()).unwrap_or(false) {
    return Ok(entries[0].path());
  }
  Ok(dest.to_path_buf())
}

/// Convert a source URL to a safe file name.
///
/// Takes the last path component and sanitizes it. Falls back to a hash of the
/// URL if no suitable file name can be extracted.
pub fn source_file_name(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split(['?', '#']).next().unwrap_or(filename);

    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
      return sanitized;
    }
  }

  let mut hasher = Sha256::new();
  hasher.update(url.as_bytes());
  format!("source_{}", &hex::encode(hasher.finalize())[..16])
}
