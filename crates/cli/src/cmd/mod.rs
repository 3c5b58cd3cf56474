mod check;
mod digest;
mod run;

pub use check::cmd_check;
pub use digest::cmd_digest;
pub use run::{RunArgs, cmd_run};

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kiln_lib::Recipe;
use kiln_lib::recipe::load_recipe;

/// Load a recipe file, resolving its path for diagnostics.
pub(crate) fn read_recipe(path: &Path) -> Result<(PathBuf, Recipe)> {
  let resolved = dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
  let recipe = load_recipe(&resolved).with_context(|| format!("Failed to load recipe {}", path.display()))?;
  Ok((resolved, recipe))
}
