use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Serializer};

use super::state::{Stage, StageTiming};
use crate::build::BuildOutcome;
use crate::error::ErrorKind;
use crate::install::InstalledArtifact;

/// Serialize a `Duration` as whole milliseconds.
pub fn duration_ms<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
  pub kind: ErrorKind,
  pub message: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
  pub recipe: String,
  pub version: String,
  /// `Succeeded`, or the stage the run failed in.
  pub stage_reached: Stage,
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<StageFailure>,
  pub timings: Vec<StageTiming>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub build: Option<BuildOutcome>,
  /// Installed artifacts; empty unless the run succeeded.
  pub installed: Vec<InstalledArtifact>,
  /// Tail of the self-test output, when the test passed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub test_output: Option<String>,
  /// Work directory, when it was kept.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub work_dir: Option<PathBuf>,
  /// The recipe declared that its commands need the network.
  pub network_requested: bool,
}

impl PipelineResult {
  pub fn error_kind(&self) -> Option<ErrorKind> {
    self.error.as_ref().map(|e| e.kind)
  }

  /// True when the run failed in `stage`.
  pub fn failed_at(&self, stage: Stage) -> bool {
    !self.success && self.stage_reached == stage
  }

  pub fn total_duration(&self) -> Duration {
    self.timings.iter().map(|t| t.duration).sum()
  }
}
