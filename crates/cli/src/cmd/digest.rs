//! Implementation of the `kiln digest` command.

use std::path::Path;

use anyhow::{Context, Result};
use kiln_lib::verify::{HashAlgorithm, digest_file};

/// Print `<algorithm>:<hex>` for `file`, ready to paste into a recipe.
pub fn cmd_digest(file: &Path, algorithm: HashAlgorithm) -> Result<()> {
  let digest = digest_file(file, algorithm).with_context(|| format!("Failed to read {}", file.display()))?;
  println!("{}", digest);
  Ok(())
}
