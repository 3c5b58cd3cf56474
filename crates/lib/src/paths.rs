//! Default locations for the fetch cache and per-run work directories.
//!
//! Both can be overridden with `KILN_CACHE_DIR` / `KILN_WORK_DIR`; otherwise
//! the XDG base directories are used on Unix and `%LOCALAPPDATA%` on Windows.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Environment variable overriding the cache directory.
pub const CACHE_DIR_ENV: &str = "KILN_CACHE_DIR";

/// Environment variable overriding the work directory root.
pub const WORK_DIR_ENV: &str = "KILN_WORK_DIR";

/// Returns the user's home directory, falling back to the system temp dir.
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var_os("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(std::env::temp_dir)
}

/// Returns the user's home directory, falling back to the system temp dir.
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(std::env::temp_dir)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
    return PathBuf::from(dir);
  }
  std::env::var_os("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(home_dir)
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
    return PathBuf::from(dir);
  }
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Returns the root under which per-run work directories are created.
pub fn work_dir() -> PathBuf {
  if let Some(dir) = std::env::var_os(WORK_DIR_ENV) {
    return PathBuf::from(dir);
  }
  std::env::temp_dir().join(format!("{}-work", APP_NAME))
}

/// Verified source downloads, named by digest.
pub fn downloads_dir(cache: &std::path::Path) -> PathBuf {
  cache.join("downloads")
}

/// Advisory install-prefix lock files.
pub fn locks_dir(cache: &std::path::Path) -> PathBuf {
  cache.join("locks")
}
