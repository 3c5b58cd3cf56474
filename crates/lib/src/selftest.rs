//! Post-install smoke test.
//!
//! Runs the recipe's test command against the freshly installed artifacts and
//! matches its combined output against the expected pattern. A bare program
//! name is looked up in `<prefix>/bin` first, and `<prefix>/bin` leads `PATH`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consts::{DEFAULT_TEST_TIMEOUT, OUTPUT_TAIL_LINES};
use crate::error::ErrorKind;
use crate::pipeline::duration_ms;
use crate::process::{self, ProcessError, ProcessSpec, isolated_env, output_tail};
use crate::recipe::Recipe;
use crate::workspace::Workspace;

/// Output of a passing self-test.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
  pub program: PathBuf,
  /// Stdout followed by stderr.
  pub output: String,
  #[serde(rename = "duration_ms", serialize_with = "duration_ms")]
  pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum TestError {
  #[error("failed to start test command {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("self-test timed out after {timeout:?}")]
  Timeout { timeout: Duration },

  #[error("self-test exited with {}\n{output_tail}", describe_exit(.code))]
  NonZeroExit { code: Option<i32>, output_tail: String },

  #[error("self-test output does not match {pattern}\n{output_tail}")]
  PatternMismatch { pattern: String, output_tail: String },

  #[error("invalid output pattern: {0}")]
  InvalidPattern(String),

  #[error("self-test cancelled")]
  Cancelled,

  #[error("self-test I/O error: {0}")]
  Io(#[source] io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("code {code}"),
    None => "a signal".to_string(),
  }
}

impl TestError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      TestError::Timeout { .. } => ErrorKind::TestTimeout,
      TestError::NonZeroExit { .. } => ErrorKind::TestNonZeroExit,
      TestError::PatternMismatch { .. } => ErrorKind::PatternMismatch,
      TestError::Cancelled => ErrorKind::Cancelled,
      TestError::Spawn { .. } | TestError::InvalidPattern(_) | TestError::Io(_) => ErrorKind::TestFailed,
    }
  }
}

impl From<ProcessError> for TestError {
  fn from(value: ProcessError) -> Self {
    match value {
      ProcessError::Spawn { program, source } => TestError::Spawn { program, source },
      ProcessError::Timeout { timeout, .. } => TestError::Timeout { timeout },
      ProcessError::Cancelled { .. } => TestError::Cancelled,
      ProcessError::Io { source, .. } => TestError::Io(source),
    }
  }
}

#[derive(Debug, Clone)]
pub struct SelfTestRunner {
  timeout: Duration,
}

impl Default for SelfTestRunner {
  fn default() -> Self {
    Self::new(DEFAULT_TEST_TIMEOUT)
  }
}

impl SelfTestRunner {
  pub fn new(timeout: Duration) -> Self {
    Self { timeout }
  }

  /// Run the test command. Exit status is checked before the pattern.
  pub async fn run(
    &self,
    recipe: &Recipe,
    workspace: &Workspace,
    cancel: &CancellationToken,
  ) -> Result<TestOutcome, TestError> {
    let bin_dir = recipe.install_prefix.join("bin");
    let env = isolated_env(&workspace.home_dir(), &workspace.tmp_dir(), &recipe.sandbox, Some(&bin_dir));

    let mut spec = ProcessSpec::from_argv(&recipe.test_command, workspace.tmp_dir(), env, self.timeout);
    let program = resolve_installed(&spec.program, &bin_dir);
    spec.program = program.display().to_string();

    info!(recipe = %recipe.label(), command = %spec.display(), "running self-test");
    let output = process::run(&spec, cancel).await?;
    let combined = output.combined();

    if !output.success() {
      warn!(exit_code = ?output.exit_code, "self-test failed");
      return Err(TestError::NonZeroExit {
        code: output.exit_code,
        output_tail: output_tail(&combined, OUTPUT_TAIL_LINES),
      });
    }

    let matched = recipe
      .expected_output_pattern
      .matches(&combined)
      .map_err(|e| TestError::InvalidPattern(e.to_string()))?;
    if !matched {
      return Err(TestError::PatternMismatch {
        pattern: recipe.expected_output_pattern.to_string(),
        output_tail: output_tail(&combined, OUTPUT_TAIL_LINES),
      });
    }

    debug!(pattern = %recipe.expected_output_pattern, "self-test output matched");
    Ok(TestOutcome {
      program,
      output: combined,
      duration: output.duration,
    })
  }
}

/// `name` -> `<bin_dir>/name` when that file exists. Paths are left alone.
fn resolve_installed(program: &str, bin_dir: &Path) -> PathBuf {
  if !program.contains('/') {
    let candidate = bin_dir.join(program);
    if candidate.is_file() {
      return candidate;
    }
  }
  PathBuf::from(program)
}
