//! Implementation of the `kiln check` command.

use std::path::Path;

use anyhow::{Context, Result};

use crate::output::{OutputFormat, print_json, print_stat, print_success};

/// Validate a recipe and print what a run would do.
pub fn cmd_check(path: &Path, output: OutputFormat) -> Result<()> {
  let (resolved, recipe) = super::read_recipe(path)?;
  recipe
    .validate()
    .with_context(|| format!("Invalid recipe {}", resolved.display()))?;

  if output.is_json() {
    return print_json(&recipe);
  }

  print_success(&format!("{} {} is valid", recipe.name, recipe.version));
  print_stat("Source", &recipe.source_url);
  print_stat("Digest", &recipe.expected_digest.to_string());
  print_stat("Build", &recipe.build_command.join(" "));
  print_stat("Prefix", &recipe.install_prefix.display().to_string());
  print_stat("Artifacts", &recipe.artifact_paths.len().to_string());
  print_stat(
    "Self-test",
    &format!("{} (expects {})", recipe.test_command.join(" "), recipe.expected_output_pattern),
  );
  if recipe.sandbox.allow_network {
    print_stat("Network", "requested");
  }

  Ok(())
}
