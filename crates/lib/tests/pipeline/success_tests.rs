//! Runs that reach `Succeeded`.

use std::os::unix::fs::PermissionsExt;

use kiln_lib::pipeline::{CancelHandle, Stage};
use kiln_lib::recipe::OutputPattern;

use super::common::*;

#[tokio::test]
async fn ocli_recipe_installs_and_passes_self_test() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let mock = env.serve(&source).await;
  let recipe = env.recipe(sha256(&source));

  let result = env.pipeline().execute(&recipe, CancelHandle::new()).await;

  mock.assert_async().await;
  assert!(result.success, "pipeline failed: {:?}", result.error);
  assert_eq!(result.stage_reached, Stage::Succeeded);
  assert!(result.error.is_none());

  let stages: Vec<Stage> = result.timings.iter().map(|t| t.stage).collect();
  assert_eq!(
    stages,
    vec![
      Stage::Pending,
      Stage::Fetching,
      Stage::Verifying,
      Stage::Building,
      Stage::Installing,
      Stage::Testing
    ]
  );

  let exe = env.prefix().join("bin/ocli");
  assert_eq!(
    std::fs::read_to_string(&exe).unwrap(),
    tool_script("OCLI v0.2.0")
  );
  assert_eq!(std::fs::metadata(&exe).unwrap().permissions().mode() & 0o111, 0o111);
  assert!(env.prefix().join("share/ocli/README.md").is_file());

  assert_eq!(result.installed.len(), 2);
  assert_eq!(result.installed[0].installed_path, exe);
  assert!(result.test_output.as_deref().unwrap().contains("OCLI v0.2.0"));
  assert_eq!(result.build.as_ref().unwrap().exit_code, 0);
}

#[tokio::test]
async fn prefix_contains_only_artifacts() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let _mock = env.serve(&source).await;

  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(&source)), CancelHandle::new())
    .await;

  assert!(result.success);
  assert_eq!(
    listing(&env.prefix()),
    vec!["bin", "bin/ocli", "share", "share/ocli", "share/ocli/README.md"]
  );
}

#[tokio::test]
async fn work_dir_removed_unless_kept() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let _mock = env.serve(&source).await;
  let recipe = env.recipe(sha256(&source));

  let result = env.pipeline().execute(&recipe, CancelHandle::new()).await;
  assert!(result.success);
  assert!(result.work_dir.is_none());
  assert!(listing(&env.config().work_dir).is_empty());

  let mut config = env.config();
  config.keep_work_dir = true;
  let pipeline = kiln_lib::RecipePipeline::new(config).unwrap();
  let result = pipeline.execute(&recipe, CancelHandle::new()).await;

  let kept = result.work_dir.expect("work dir kept");
  assert!(kept.join("src/ocli-0.2.0/build.sh").is_file());
}

#[tokio::test]
async fn second_run_uses_verified_cache() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let mock = env
    .server
    .mock("GET", "/ocli-0.2.0.tar.gz")
    .with_body(&source)
    .expect(1)
    .create_async()
    .await;
  let recipe = env.recipe(sha256(&source));
  let pipeline = env.pipeline();

  assert!(pipeline.execute(&recipe, CancelHandle::new()).await.success);
  assert!(pipeline.execute(&recipe, CancelHandle::new()).await.success);

  // One download; the second run read the cache.
  mock.assert_async().await;
}

#[tokio::test]
async fn reinstall_replaces_previous_version() {
  let mut env = TestEnv::new().await;
  let old = source_archive(BUILD_SH, &tool_script("OCLI v0.1.0"));
  let mock = env.serve(&old).await;
  let mut recipe = env.recipe(sha256(&old));
  recipe.expected_output_pattern = OutputPattern::Literal("OCLI v0.1.0".to_string());
  assert!(env.pipeline().execute(&recipe, CancelHandle::new()).await.success);
  mock.remove_async().await;

  let new = ocli_source();
  let _mock = env.serve(&new).await;
  let result = env
    .pipeline()
    .execute(&env.recipe(sha256(&new)), CancelHandle::new())
    .await;

  assert!(result.success, "pipeline failed: {:?}", result.error);
  assert_eq!(
    std::fs::read_to_string(env.prefix().join("bin/ocli")).unwrap(),
    tool_script("OCLI v0.2.0")
  );
}

#[tokio::test]
async fn regex_pattern_and_json_result() {
  let mut env = TestEnv::new().await;
  let source = ocli_source();
  let _mock = env.serve(&source).await;
  let mut recipe = env.recipe(sha256(&source));
  recipe.expected_output_pattern = OutputPattern::Regex(r"(?m)^OCLI v0\.2\.\d+$".to_string());

  let result = env.pipeline().execute(&recipe, CancelHandle::new()).await;
  assert!(result.success, "pipeline failed: {:?}", result.error);

  let json = serde_json::to_value(&result).unwrap();
  assert_eq!(json["stage_reached"], "succeeded");
  assert_eq!(json["success"], true);
  assert_eq!(json["installed"].as_array().unwrap().len(), 2);
}
