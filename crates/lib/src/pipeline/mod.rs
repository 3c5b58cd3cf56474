//! Recipe pipeline orchestration.
//!
//! Drives one recipe through
//! `Pending → Fetching → Verifying → Building → Installing → Testing → Succeeded`.
//! Any failure moves the run to `Failed(stage, kind)` and halts it. Stages are
//! never skipped or repeated, and nothing is retried across stage boundaries;
//! transient fetch failures are retried inside the fetcher.
//!
//! # Submodules
//!
//! - [`state`] - Stage enum and transition rules
//! - [`types`] - `PipelineResult` and friends

pub mod state;
mod types;

pub use state::{RunState, Stage, StageTiming, StateMachine, TransitionError};
pub use types::*;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::build::{BuildExecutor, BuildOutcome};
use crate::config::PipelineConfig;
use crate::consts::OUTPUT_TAIL_LINES;
use crate::error::PipelineError;
use crate::fetch::SourceFetcher;
use crate::install::{InstallError, InstallStager, InstalledArtifact};
use crate::install_lock::InstallLock;
use crate::process::output_tail;
use crate::recipe::Recipe;
use crate::selftest::SelfTestRunner;
use crate::verify;
use crate::workspace::Workspace;

/// Cancels a running pipeline. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.is_cancelled()
  }

  pub fn token(&self) -> &CancellationToken {
    &self.0
  }
}

/// What a run accumulates on its way through the stages.
#[derive(Default)]
struct RunRecord {
  workspace: Option<Workspace>,
  build: Option<BuildOutcome>,
  installed: Vec<InstalledArtifact>,
  test_output: Option<String>,
}

/// Executes recipes. One instance can run any number of recipes, including
/// concurrently; runs share nothing but the filesystem.
#[derive(Debug, Clone)]
pub struct RecipePipeline {
  config: PipelineConfig,
  fetcher: SourceFetcher,
  builder: BuildExecutor,
  stager: InstallStager,
  tester: SelfTestRunner,
}

impl RecipePipeline {
  pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
    let mut fetcher = SourceFetcher::new(config.fetch.clone())?;
    if config.use_cache {
      fetcher = fetcher.with_cache(config.downloads_dir());
    }

    Ok(Self {
      builder: BuildExecutor::new(config.build_timeout),
      stager: InstallStager::new(),
      tester: SelfTestRunner::new(config.test_timeout),
      fetcher,
      config,
    })
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  /// Run `recipe` to completion.
  ///
  /// Never panics on a failing stage; the failure is reported in the result.
  pub async fn execute(&self, recipe: &Recipe, cancel: CancelHandle) -> PipelineResult {
    let label = recipe.label();
    info!(recipe = %label, source = %recipe.source_url, prefix = ?recipe.install_prefix, "starting pipeline");
    audit_sandbox(recipe);

    let mut machine = StateMachine::new();
    let mut record = RunRecord::default();
    let outcome = self.drive(recipe, &mut machine, &mut record, cancel.token()).await;

    let error = match outcome {
      Ok(()) => {
        info!(recipe = %label, "pipeline succeeded");
        None
      }
      Err(err) => {
        let kind = err.kind();
        match machine.fail(kind) {
          Ok(stage) => error!(recipe = %label, stage = %stage, kind = %kind, error = %err, "pipeline failed"),
          Err(e) => error!(recipe = %label, error = %err, transition = %e, "pipeline failed in terminal state"),
        }
        Some(StageFailure {
          kind,
          message: err.to_string(),
        })
      }
    };

    let work_dir = record.workspace.take().and_then(|ws| {
      if self.config.keep_work_dir {
        let path = ws.keep();
        info!(path = ?path, "kept work directory");
        Some(path)
      } else {
        None
      }
    });

    PipelineResult {
      recipe: recipe.name.clone(),
      version: recipe.version.clone(),
      stage_reached: machine.stage(),
      success: error.is_none(),
      error,
      timings: machine.timings().to_vec(),
      build: record.build,
      installed: record.installed,
      test_output: record.test_output,
      work_dir,
      network_requested: recipe.sandbox.allow_network,
    }
  }

  /// Run `recipe` on the tokio runtime. The handle cancels it.
  pub fn spawn(&self, recipe: Recipe) -> (CancelHandle, JoinHandle<PipelineResult>) {
    let cancel = CancelHandle::new();
    let pipeline = self.clone();
    let handle = cancel.clone();
    let task = tokio::spawn(async move { pipeline.execute(&recipe, handle).await });
    (cancel, task)
  }

  async fn drive(
    &self,
    recipe: &Recipe,
    machine: &mut StateMachine,
    record: &mut RunRecord,
    cancel: &CancellationToken,
  ) -> Result<(), PipelineError> {
    // Pending
    recipe.validate()?;
    let label = recipe.label();

    enter(machine, Stage::Fetching, &label, cancel)?;
    let fetched = self
      .fetcher
      .fetch(&recipe.source_url, &recipe.expected_digest, cancel)
      .await?;

    enter(machine, Stage::Verifying, &label, cancel)?;
    verify::verify(&fetched, &recipe.expected_digest)?;
    if self.config.use_cache
      && !fetched.from_cache
      && let Err(e) = self.fetcher.store_in_cache(&fetched.actual_digest, &fetched.bytes).await
    {
      warn!(error = %e, "failed to cache verified source");
    }

    enter(machine, Stage::Building, &label, cancel)?;
    let workspace = record.workspace.insert(
      Workspace::create(&self.config.work_dir, &label).map_err(PipelineError::Workspace)?,
    );
    let build = self.builder.run(recipe, workspace, fetched.bytes, cancel).await?;
    let source_root = build.source_root.clone();
    record.build = Some(build);

    enter(machine, Stage::Installing, &label, cancel)?;
    let _lock = InstallLock::acquire(
      &self.config.locks_dir(),
      &recipe.install_prefix,
      &label,
      self.config.lock_timeout,
      cancel,
    )
    .await
    .map_err(InstallError::from)?;

    let stager = self.stager.clone();
    let owned = recipe.clone();
    let installation = tokio::task::spawn_blocking(move || stager.install(&owned, &source_root)).await??;

    enter(machine, Stage::Testing, &label, cancel).inspect_err(|_| {
      debug!("cancelled before self-test, installation will roll back");
    })?;
    let tested = self.tester.run(recipe, workspace, cancel).await;

    match tested {
      Ok(outcome) => {
        record.installed = tokio::task::spawn_blocking(move || installation.finalize()).await?;
        record.test_output = Some(output_tail(&outcome.output, OUTPUT_TAIL_LINES));
      }
      Err(err) => {
        warn!(recipe = %label, error = %err, "self-test failed, rolling back installation");
        tokio::task::spawn_blocking(move || installation.rollback()).await?;
        return Err(err.into());
      }
    }

    machine.advance(Stage::Succeeded)?;
    Ok(())
  }
}

/// Advance to `stage` unless the run was cancelled.
fn enter(machine: &mut StateMachine, stage: Stage, label: &str, cancel: &CancellationToken) -> Result<(), PipelineError> {
  machine.advance(stage)?;
  info!(recipe = %label, stage = %stage, "entering stage");
  if cancel.is_cancelled() {
    return Err(PipelineError::Cancelled);
  }
  Ok(())
}

/// Log every opt-in beyond the default isolated environment.
fn audit_sandbox(recipe: &Recipe) {
  let policy = &recipe.sandbox;
  if policy.is_default() {
    debug!(recipe = %recipe.label(), "using default sandbox policy");
    return;
  }
  let label = recipe.label();
  for name in &policy.pass_env {
    warn!(recipe = %label, var = %name, "sandbox opt-in: passing host environment variable");
  }
  for key in policy.env.keys() {
    warn!(recipe = %label, var = %key, "sandbox opt-in: setting environment variable");
  }
  if policy.allow_network {
    warn!(recipe = %label, "sandbox opt-in: network access requested (not enforced)");
  }
}
