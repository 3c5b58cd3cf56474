use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::error::ErrorKind;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
  Pending,
  Fetching,
  Verifying,
  Building,
  Installing,
  Testing,
  Succeeded,
}

impl Stage {
  /// The only stage that may follow this one on success.
  pub fn next(self) -> Option<Stage> {
    match self {
      Stage::Pending => Some(Stage::Fetching),
      Stage::Fetching => Some(Stage::Verifying),
      Stage::Verifying => Some(Stage::Building),
      Stage::Building => Some(Stage::Installing),
      Stage::Installing => Some(Stage::Testing),
      Stage::Testing => Some(Stage::Succeeded),
      Stage::Succeeded => None,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Stage::Pending => "Pending",
      Stage::Fetching => "Fetching",
      Stage::Verifying => "Verifying",
      Stage::Building => "Building",
      Stage::Installing => "Installing",
      Stage::Testing => "Testing",
      Stage::Succeeded => "Succeeded",
    }
  }
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  Active(Stage),
  Failed { stage: Stage, kind: ErrorKind },
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunState::Active(stage) => write!(f, "{stage}"),
      RunState::Failed { stage, kind } => write!(f, "Failed({stage}, {kind})"),
    }
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot move from {from} to {to}")]
pub struct TransitionError {
  pub from: RunState,
  pub to: String,
}

/// Time spent in one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageTiming {
  pub stage: Stage,
  #[serde(rename = "duration_ms", serialize_with = "super::duration_ms")]
  pub duration: Duration,
}

/// Enforces strictly sequential, single-shot stage transitions.
#[derive(Debug)]
pub struct StateMachine {
  state: RunState,
  entered: Instant,
  timings: Vec<StageTiming>,
}

impl Default for StateMachine {
  fn default() -> Self {
    Self::new()
  }
}

impl StateMachine {
  pub fn new() -> Self {
    Self {
      state: RunState::Active(Stage::Pending),
      entered: Instant::now(),
      timings: Vec::new(),
    }
  }

  pub fn state(&self) -> RunState {
    self.state
  }

  /// Current stage, or the stage the run failed in.
  pub fn stage(&self) -> Stage {
    match self.state {
      RunState::Active(stage) | RunState::Failed { stage, .. } => stage,
    }
  }

  pub fn timings(&self) -> &[StageTiming] {
    &self.timings
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self.state, RunState::Active(Stage::Succeeded) | RunState::Failed { .. })
  }

  /// Move to `to`, which must be the successor of the current stage.
  pub fn advance(&mut self, to: Stage) -> Result<(), TransitionError> {
    match self.state {
      RunState::Active(current) if current.next() == Some(to) => {
        self.close_stage(current);
        self.state = RunState::Active(to);
        Ok(())
      }
      from => Err(TransitionError {
        from,
        to: to.to_string(),
      }),
    }
  }

  /// Fail the current stage. Returns the stage that failed.
  pub fn fail(&mut self, kind: ErrorKind) -> Result<Stage, TransitionError> {
    match self.state {
      RunState::Active(stage) if stage != Stage::Succeeded => {
        self.close_stage(stage);
        self.state = RunState::Failed { stage, kind };
        Ok(stage)
      }
      from => Err(TransitionError {
        from,
        to: "Failed".to_string(),
      }),
    }
  }

  fn close_stage(&mut self, stage: Stage) {
    let now = Instant::now();
    self.timings.push(StageTiming {
      stage,
      duration: now.duration_since(self.entered),
    });
    self.entered = now;
  }
}
