//! Build execution.
//!
//! Unpacks verified source into the run's workspace and runs the recipe's
//! build command from the extraction root, with the isolated environment
//! described in [`crate::process::isolated_env`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consts::{DEFAULT_BUILD_TIMEOUT, OUTPUT_TAIL_LINES};
use crate::error::ErrorKind;
use crate::extract::{ExtractError, source_file_name};
use crate::pipeline::duration_ms;
use crate::process::{self, ProcessError, ProcessOutput, ProcessSpec, isolated_env, output_tail};
use crate::recipe::Recipe;
use crate::workspace::Workspace;

/// Result of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
  pub exit_code: i32,
  pub stdout: String,
  pub stderr: String,
  #[serde(rename = "duration_ms", serialize_with = "duration_ms")]
  pub duration: Duration,
  /// Directory the build ran in; artifact paths are relative to it.
  pub source_root: PathBuf,
}

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("failed to unpack source: {0}")]
  Extract(#[from] ExtractError),

  #[error("failed to start build command {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("build timed out after {timeout:?}")]
  Timeout { timeout: Duration },

  #[error("build exited with code {code}\n{output_tail}")]
  NonZeroExit { code: i32, output_tail: String },

  #[error("build was terminated by a signal\n{output_tail}")]
  Signaled { output_tail: String },

  #[error("build cancelled")]
  Cancelled,

  #[error("build I/O error: {0}")]
  Io(#[source] io::Error),
}

impl BuildError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      BuildError::Timeout { .. } => ErrorKind::BuildTimeout,
      BuildError::NonZeroExit { .. } => ErrorKind::BuildNonZeroExit,
      BuildError::Cancelled => ErrorKind::Cancelled,
      BuildError::Extract(_) | BuildError::Spawn { .. } | BuildError::Signaled { .. } | BuildError::Io(_) => {
        ErrorKind::BuildFailed
      }
    }
  }
}

impl From<ProcessError> for BuildError {
  fn from(value: ProcessError) -> Self {
    match value {
      ProcessError::Spawn { program, source } => BuildError::Spawn { program, source },
      ProcessError::Timeout { timeout, .. } => BuildError::Timeout { timeout },
      ProcessError::Cancelled { .. } => BuildError::Cancelled,
      ProcessError::Io { source, .. } => BuildError::Io(source),
    }
  }
}

#[derive(Debug, Clone)]
pub struct BuildExecutor {
  timeout: Duration,
}

impl Default for BuildExecutor {
  fn default() -> Self {
    Self::new(DEFAULT_BUILD_TIMEOUT)
  }
}

impl BuildExecutor {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }

  /// Unpack `source` into `workspace` and run the build command.
  ///
  /// `source` must already have passed integrity verification.
  pub async fn run(
    &self,
    recipe: &Recipe,
    workspace: &mut Workspace,
    source: Vec<u8>,
    cancel: &CancellationToken,
  ) -> Result<BuildOutcome, BuildError> {
    if cancel.is_cancelled() {
      return Err(BuildError::Cancelled);
    }

    let file_name = source_file_name(&recipe.source_url);
    let source_root = workspace.unpack(source, file_name).await?;

    let env = isolated_env(&workspace.home_dir(), &workspace.tmp_dir(), &recipe.sandbox, None);
    let spec = ProcessSpec::from_argv(&recipe.build_command, &source_root, env, self.timeout);

    info!(recipe = %recipe.label(), command = %spec.display(), "running build");
    let output = process::run(&spec, cancel).await?;

    match output.exit_code {
      Some(0) => {
        debug!(duration = ?output.duration, "build succeeded");
        Ok(BuildOutcome {
          exit_code: 0,
          stdout: output.stdout,
          stderr: output.stderr,
          duration: output.duration,
          source_root,
        })
      }
      Some(code) => Err(BuildError::NonZeroExit {
        code,
        output_tail: failure_tail(&output),
      }),
      None => Err(BuildError::Signaled {
        output_tail: failure_tail(&output),
      }),
    }
  }
}

/// Stderr tail, or stdout's when the build wrote nothing to stderr.
fn failure_tail(output: &ProcessOutput) -> String {
  let text = if output.stderr.trim().is_empty() {
    &output.stdout
  } else {
    &output.stderr
  };
  output_tail(text, OUTPUT_TAIL_LINES)
}
