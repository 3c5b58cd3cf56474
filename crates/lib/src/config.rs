//! Pipeline configuration.
//!
//! Defaults come from [`crate::paths`] and [`crate::consts`]; the CLI
//! overrides individual fields from its flags.

use std::path::PathBuf;
use std::time::Duration;

use crate::consts::{DEFAULT_BUILD_TIMEOUT, DEFAULT_LOCK_TIMEOUT, DEFAULT_TEST_TIMEOUT};
use crate::fetch::FetchConfig;
use crate::paths;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// Root for the download cache and lock files.
  pub cache_dir: PathBuf,
  /// Root under which per-run work directories are created.
  pub work_dir: PathBuf,
  pub fetch: FetchConfig,
  pub build_timeout: Duration,
  pub test_timeout: Duration,
  /// How long to wait for another run holding the install prefix.
  pub lock_timeout: Duration,
  /// Keep the per-run work directory after the run, successful or not.
  pub keep_work_dir: bool,
  /// Read and populate the verified download cache.
  pub use_cache: bool,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      cache_dir: paths::cache_dir(),
      work_dir: paths::work_dir(),
      fetch: FetchConfig::default(),
      build_timeout: DEFAULT_BUILD_TIMEOUT,
      test_timeout: DEFAULT_TEST_TIMEOUT,
      lock_timeout: DEFAULT_LOCK_TIMEOUT,
      keep_work_dir: false,
      use_cache: true,
    }
  }
}

impl PipelineConfig {
  /// Configuration rooted entirely in `root`, for tests and throwaway runs.
  pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    Self {
      cache_dir: root.join("cache"),
      work_dir: root.join("work"),
      ..Self::default()
    }
  }

  pub fn downloads_dir(&self) -> PathBuf {
    paths::downloads_dir(&self.cache_dir)
  }

  pub fn locks_dir(&self) -> PathBuf {
    paths::locks_dir(&self.cache_dir)
  }
}
