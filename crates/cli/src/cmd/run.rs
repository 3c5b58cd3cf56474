//! Implementation of the `kiln run` command.
//!
//! Loads a recipe, applies flag overrides to the pipeline configuration and
//! drives one pipeline run. Ctrl-C cancels the run; the pipeline kills the
//! running command and rolls back any partial install.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use owo_colors::{OwoColorize, Stream};
use tracing::{info, warn};

use kiln_lib::{CancelHandle, PipelineConfig, PipelineResult, RecipePipeline};

use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_stat, print_success, symbols,
};

#[derive(Debug, Args)]
pub struct RunArgs {
  /// Path to the recipe (.toml or .json)
  pub recipe: PathBuf,

  /// Install into this prefix instead of the recipe's
  #[arg(long)]
  pub prefix: Option<PathBuf>,

  /// Directory for verified downloads and lock files
  #[arg(long, env = "KILN_CACHE_DIR")]
  pub cache_dir: Option<PathBuf>,

  /// Directory under which per-run work directories are created
  #[arg(long, env = "KILN_WORK_DIR")]
  pub work_dir: Option<PathBuf>,

  /// Timeout for a single download attempt (e.g. "30s", "2m")
  #[arg(long, value_parser = humantime::parse_duration)]
  pub fetch_timeout: Option<Duration>,

  /// Timeout for the build command
  #[arg(long, value_parser = humantime::parse_duration)]
  pub build_timeout: Option<Duration>,

  /// Timeout for the self-test command
  #[arg(long, value_parser = humantime::parse_duration)]
  pub test_timeout: Option<Duration>,

  /// Retries for transient download failures
  #[arg(long)]
  pub retries: Option<u32>,

  /// Do not read or populate the download cache
  #[arg(long)]
  pub no_cache: bool,

  /// Keep the work directory after the run
  #[arg(long)]
  pub keep_work_dir: bool,

  /// Output format
  #[arg(short, long, value_enum, default_value_t)]
  pub output: OutputFormat,
}

impl RunArgs {
  fn pipeline_config(&self) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    if let Some(dir) = &self.cache_dir {
      config.cache_dir = dir.clone();
    }
    if let Some(dir) = &self.work_dir {
      config.work_dir = dir.clone();
    }
    if let Some(timeout) = self.fetch_timeout {
      config.fetch.timeout = timeout;
    }
    if let Some(timeout) = self.build_timeout {
      config.build_timeout = timeout;
    }
    if let Some(timeout) = self.test_timeout {
      config.test_timeout = timeout;
    }
    if let Some(retries) = self.retries {
      config.fetch.max_retries = retries;
    }
    config.keep_work_dir = self.keep_work_dir;
    config.use_cache = !self.no_cache;
    config
  }
}

/// Execute the run command.
///
/// Exits non-zero when the pipeline does not reach `Succeeded`.
pub fn cmd_run(args: RunArgs, verbose: bool) -> Result<()> {
  let (path, mut recipe) = super::read_recipe(&args.recipe)?;
  if let Some(prefix) = &args.prefix {
    recipe.install_prefix =
      std::path::absolute(prefix).with_context(|| format!("Failed to resolve prefix {}", prefix.display()))?;
  }

  let config = args.pipeline_config();
  info!(recipe = %path.display(), cache = %config.cache_dir.display(), "running recipe");

  if !args.output.is_json() {
    print_info(&format!(
      "{} {} {} {}",
      recipe.name,
      recipe.version,
      symbols::ARROW,
      recipe.install_prefix.display()
    ));
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt.block_on(async {
    let pipeline = RecipePipeline::new(config)?;
    let cancel = CancelHandle::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cancelling run");
        interrupt.cancel();
      }
    });

    anyhow::Ok(pipeline.execute(&recipe, cancel).await)
  })?;

  if args.output.is_json() {
    print_json(&result)?;
  } else {
    print_summary(&result, verbose);
  }

  if !result.success {
    let kind = result
      .error_kind()
      .map(|k| k.to_string())
      .unwrap_or_else(|| "unknown error".to_string());
    bail!("{} {} failed at {}: {}", result.recipe, result.version, result.stage_reached, kind);
  }

  Ok(())
}

fn print_summary(result: &PipelineResult, verbose: bool) {
  for timing in &result.timings {
    print_stat(timing.stage.name(), &format_duration(timing.duration));
  }

  if let Some(failure) = &result.error {
    println!();
    print_error(&format!("Failed({}, {})", result.stage_reached, failure.kind));
    for line in failure.message.lines() {
      eprintln!("  {}", line);
    }
    if let Some(dir) = &result.work_dir {
      eprintln!("  work directory kept at {}", dir.display());
    }
    return;
  }

  println!();
  for artifact in &result.installed {
    println!(
      "  {} {}",
      symbols::ADD.if_supports_color(Stream::Stdout, |s| s.green()),
      artifact.installed_path.display()
    );
  }

  if verbose && let Some(output) = &result.test_output {
    println!();
    println!("Self-test output:");
    for line in output.lines() {
      println!("  {}", line.if_supports_color(Stream::Stdout, |s| s.dimmed()));
    }
  }

  if let Some(dir) = &result.work_dir {
    print_stat("Work directory", &dir.display().to_string());
  }

  println!();
  print_success(&format!(
    "{} {} installed in {}",
    result.recipe,
    result.version,
    format_duration(result.total_duration())
  ));
}
