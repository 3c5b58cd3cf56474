//! Error taxonomy shared by all pipeline stages.
//!
//! Each component owns a `thiserror` enum describing its failures with
//! diagnostic context. [`PipelineError`] wraps them so the pipeline can report
//! a flat [`ErrorKind`] alongside the failing stage.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build::BuildError;
use crate::fetch::FetchError;
use crate::install::InstallError;
use crate::pipeline::TransitionError;
use crate::recipe::RecipeError;
use crate::selftest::TestError;
use crate::verify::IntegrityError;

/// Machine-readable failure classification reported in a `PipelineResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  InvalidRecipe,

  FetchTimeout,
  FetchNotFound,
  FetchNetwork,

  IntegrityMismatch,

  BuildTimeout,
  BuildNonZeroExit,
  BuildFailed,

  MissingArtifact,
  PermissionDenied,
  PathConflict,
  InstallFailed,

  TestTimeout,
  TestNonZeroExit,
  PatternMismatch,
  TestFailed,

  Cancelled,
  Internal,
}

impl ErrorKind {
  /// The error family this kind belongs to.
  pub fn family(self) -> &'static str {
    match self {
      ErrorKind::InvalidRecipe => "RecipeError",
      ErrorKind::FetchTimeout | ErrorKind::FetchNotFound | ErrorKind::FetchNetwork => "FetchError",
      ErrorKind::IntegrityMismatch => "IntegrityError",
      ErrorKind::BuildTimeout | ErrorKind::BuildNonZeroExit | ErrorKind::BuildFailed => "BuildError",
      ErrorKind::MissingArtifact | ErrorKind::PermissionDenied | ErrorKind::PathConflict | ErrorKind::InstallFailed => {
        "InstallError"
      }
      ErrorKind::TestTimeout | ErrorKind::TestNonZeroExit | ErrorKind::PatternMismatch | ErrorKind::TestFailed => {
        "TestError"
      }
      ErrorKind::Cancelled => "Cancelled",
      ErrorKind::Internal => "Internal",
    }
  }

  /// Whether the pipeline could ever retry this failure. Only fetch failures
  /// qualify, and the fetcher performs those retries itself.
  pub fn is_retryable(self) -> bool {
    matches!(self, ErrorKind::FetchTimeout | ErrorKind::FetchNetwork)
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorKind::InvalidRecipe => "InvalidRecipe",
      ErrorKind::FetchTimeout => "Timeout",
      ErrorKind::FetchNotFound => "NotFound",
      ErrorKind::FetchNetwork => "NetworkError",
      ErrorKind::IntegrityMismatch => "Mismatch",
      ErrorKind::BuildTimeout => "Timeout",
      ErrorKind::BuildNonZeroExit => "NonZeroExit",
      ErrorKind::BuildFailed => "Failed",
      ErrorKind::MissingArtifact => "MissingArtifact",
      ErrorKind::PermissionDenied => "PermissionDenied",
      ErrorKind::PathConflict => "PathConflict",
      ErrorKind::InstallFailed => "Failed",
      ErrorKind::TestTimeout => "Timeout",
      ErrorKind::TestNonZeroExit => "NonZeroExit",
      ErrorKind::PatternMismatch => "PatternMismatch",
      ErrorKind::TestFailed => "Failed",
      ErrorKind::Cancelled => "Cancelled",
      ErrorKind::Internal => "Internal",
    };
    write!(f, "{}{{{}}}", self.family(), name)
  }
}

/// Any failure that halts a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
  #[error(transparent)]
  Recipe(#[from] RecipeError),

  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Integrity(#[from] IntegrityError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Install(#[from] InstallError),

  #[error(transparent)]
  Test(#[from] TestError),

  #[error("invalid state transition: {0}")]
  State(#[from] TransitionError),

  #[error("pipeline cancelled")]
  Cancelled,

  #[error("failed to prepare work directory: {0}")]
  Workspace(#[source] std::io::Error),

  #[error("background task failed: {0}")]
  Join(String),
}

impl PipelineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      PipelineError::Recipe(_) => ErrorKind::InvalidRecipe,
      PipelineError::Fetch(e) => e.kind(),
      PipelineError::Integrity(e) => e.kind(),
      PipelineError::Build(e) => e.kind(),
      PipelineError::Install(e) => e.kind(),
      PipelineError::Test(e) => e.kind(),
      PipelineError::Cancelled => ErrorKind::Cancelled,
      PipelineError::Workspace(_) => ErrorKind::BuildFailed,
      PipelineError::State(_) | PipelineError::Join(_) => ErrorKind::Internal,
    }
  }
}

impl From<tokio::task::JoinError> for PipelineError {
  fn from(value: tokio::task::JoinError) -> Self {
    PipelineError::Join(value.to_string())
  }
}
