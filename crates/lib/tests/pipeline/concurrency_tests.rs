//! Concurrent runs and cancellation.

use std::path::Path;
use std::time::{Duration, Instant};

use kiln_lib::ErrorKind;
use kiln_lib::install_lock::InstallLock;
use kiln_lib::pipeline::{CancelHandle, Stage};

use super::common::*;

/// A tool whose `--version` records when it started and finished in `log`.
fn logging_tool(log: &Path) -> String {
  format!(
    "#!/bin/sh\necho \"start $$\" >> {log}\nsleep 0.3\necho \"end $$\" >> {log}\necho \"OCLI v0.2.0\"\n",
    log = log.display()
  )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_prefix_runs_serialize() {
  let mut env = TestEnv::new().await;
  let log = env.temp.path().join("selftest.log");
  let source = source_archive(BUILD_SH, &logging_tool(&log));
  let _mock = env.serve(&source).await;
  let recipe = env.recipe(sha256(&source));
  let pipeline = env.pipeline();

  let (_a, first) = pipeline.spawn(recipe.clone());
  let (_b, second) = pipeline.spawn(recipe.clone());
  let (first, second) = (first.await.unwrap(), second.await.unwrap());

  assert!(first.success, "first run failed: {:?}", first.error);
  assert!(second.success, "second run failed: {:?}", second.error);

  // Each self-test ran start-to-end without the other in between.
  let lines: Vec<String> = std::fs::read_to_string(&log)
    .unwrap()
    .lines()
    .map(str::to_string)
    .collect();
  assert_eq!(lines.len(), 4, "log: {lines:?}");
  let pid = |line: &str| line.split_whitespace().nth(1).unwrap().to_string();
  assert!(lines[0].starts_with("start") && lines[1].starts_with("end"), "log: {lines:?}");
  assert!(lines[2].starts_with("start") && lines[3].starts_with("end"), "log: {lines:?}");
  assert_eq!(pid(&lines[0]), pid(&lines[1]));
  assert_eq!(pid(&lines[2]), pid(&lines[3]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_prefixes_run_independently() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let _mock = env.serve(&source).await;
  let pipeline = env.pipeline();

  let mut a = env.recipe(sha256(&source));
  a.install_prefix = env.temp.path().join("prefix-a");
  let mut b = env.recipe(sha256(&source));
  b.install_prefix = env.temp.path().join("prefix-b");

  let (_ca, ra) = pipeline.spawn(a);
  let (_cb, rb) = pipeline.spawn(b);
  let (ra, rb) = (ra.await.unwrap(), rb.await.unwrap());

  assert!(ra.success && rb.success);
  assert!(env.temp.path().join("prefix-a/bin/ocli").is_file());
  assert!(env.temp.path().join("prefix-b/bin/ocli").is_file());
}

#[tokio::test]
async fn cancel_during_build_kills_it() {
  let mut env = TestEnv::new().await;
  let source = source_archive("#!/bin/sh\nsleep 30\n", &tool_script("OCLI v0.2.0"));
  let _mock = env.serve(&source).await;
  let pipeline = env.pipeline();

  let started = Instant::now();
  let (cancel, task) = pipeline.spawn(env.recipe(sha256(&source)));
  tokio::time::sleep(Duration::from_millis(500)).await;
  cancel.cancel();
  let result = task.await.unwrap();

  assert!(result.failed_at(Stage::Building));
  assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
  assert!(started.elapsed() < Duration::from_secs(15));
  assert!(!env.prefix().exists());
}

#[tokio::test]
async fn cancel_while_waiting_for_install_lock() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let _mock = env.serve(&source).await;
  let config = env.config();
  let _held = InstallLock::try_acquire(&config.locks_dir(), &env.prefix(), "other-run")
    .unwrap()
    .unwrap();

  let pipeline = env.pipeline();
  let cancel = CancelHandle::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(500)).await;
    trigger.cancel();
  });

  let result = pipeline.execute(&env.recipe(sha256(&source)), cancel).await;

  assert!(result.failed_at(Stage::Installing));
  assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
  assert!(!env.prefix().exists());
}

#[tokio::test]
async fn lock_timeout_reports_holder() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let _mock = env.serve(&source).await;
  let mut config = env.config();
  config.lock_timeout = Duration::from_millis(200);
  let _held = InstallLock::try_acquire(&config.locks_dir(), &env.prefix(), "ocli-0.1.0")
    .unwrap()
    .unwrap();

  let pipeline = kiln_lib::RecipePipeline::new(config).unwrap();
  let result = pipeline.execute(&env.recipe(sha256(&source)), CancelHandle::new()).await;

  assert!(result.failed_at(Stage::Installing));
  assert_eq!(result.error_kind(), Some(ErrorKind::InstallFailed));
  assert!(result.error.unwrap().message.contains("ocli-0.1.0"));
}
