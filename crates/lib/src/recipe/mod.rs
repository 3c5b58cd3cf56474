//! Recipe model, loading and validation.
//!
//! A recipe is pure data. The pipeline validates it in the `Pending` stage
//! before anything is fetched, so every later stage can rely on:
//! - a well-formed digest (never empty)
//! - an absolute http(s) source URL
//! - non-empty build and test commands
//! - relative, non-escaping, non-colliding artifact paths
//! - an absolute install prefix

mod types;

pub use types::*;

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::fetch::parse_source_url;

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("invalid recipe: {field}: {message}")]
  Invalid { field: &'static str, message: String },

  #[error("failed to read recipe {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse recipe {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("unsupported recipe format for {0} (expected .json or .toml)")]
  UnsupportedFormat(PathBuf),
}

impl RecipeError {
  pub fn kind(&self) -> ErrorKind {
    ErrorKind::InvalidRecipe
  }
}

fn invalid(field: &'static str, message: impl Into<String>) -> RecipeError {
  RecipeError::Invalid {
    field,
    message: message.into(),
  }
}

impl Recipe {
  /// Check every structural invariant. Returns the first violation.
  pub fn validate(&self) -> Result<(), RecipeError> {
    validate_name(&self.name)?;
    if self.version.trim().is_empty() {
      return Err(invalid("version", "must not be empty"));
    }
    if self.version.chars().any(|c| c.is_whitespace() || c == '/') {
      return Err(invalid("version", "must not contain whitespace or '/'"));
    }

    parse_source_url(&self.source_url).map_err(|e| invalid("source_url", e.to_string()))?;

    validate_command("build_command", &self.build_command)?;
    validate_command("test_command", &self.test_command)?;

    if !self.install_prefix.is_absolute() {
      return Err(invalid(
        "install_prefix",
        format!("must be absolute, got {}", self.install_prefix.display()),
      ));
    }

    if self.artifact_paths.is_empty() {
      return Err(invalid("artifact_paths", "at least one artifact is required"));
    }
    let mut destinations = HashSet::new();
    for artifact in &self.artifact_paths {
      ensure_contained("artifact_paths", &artifact.path)?;
      let dest = artifact.destination(&self.name);
      ensure_contained("artifact_paths.dest", &dest)?;
      let key: PathBuf = dest.components().filter(|c| *c != Component::CurDir).collect();
      if !destinations.insert(key) {
        return Err(invalid(
          "artifact_paths",
          format!("two artifacts install to {}", dest.display()),
        ));
      }
    }

    match &self.expected_output_pattern {
      OutputPattern::Literal(s) if s.is_empty() => {
        return Err(invalid("expected_output_pattern", "must not be empty"));
      }
      OutputPattern::Regex(pattern) => {
        Regex::new(pattern).map_err(|e| invalid("expected_output_pattern", e.to_string()))?;
      }
      OutputPattern::Literal(_) => {}
    }

    for name in &self.sandbox.pass_env {
      if name.is_empty() || name.contains('=') {
        return Err(invalid("sandbox.pass_env", format!("invalid variable name {name:?}")));
      }
    }

    Ok(())
  }
}

fn validate_name(name: &str) -> Result<(), RecipeError> {
  if name.is_empty() {
    return Err(invalid("name", "must not be empty"));
  }
  if !name
    .chars()
    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
  {
    return Err(invalid(
      "name",
      format!("{name:?} may only contain ASCII letters, digits, '-', '_', '.', '+'"),
    ));
  }
  if name.starts_with('.') {
    return Err(invalid("name", "must not start with '.'"));
  }
  Ok(())
}

fn validate_command(field: &'static str, command: &[String]) -> Result<(), RecipeError> {
  match command.first() {
    None => Err(invalid(field, "must name a program")),
    Some(program) if program.trim().is_empty() => Err(invalid(field, "program must not be empty")),
    Some(_) => Ok(()),
  }
}

/// Relative, non-empty, and free of `..` / root components.
fn ensure_contained(field: &'static str, path: &Path) -> Result<(), RecipeError> {
  if path.as_os_str().is_empty() {
    return Err(invalid(field, "path must not be empty"));
  }
  for component in path.components() {
    match component {
      Component::Normal(_) | Component::CurDir => {}
      Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
        return Err(invalid(
          field,
          format!("{} must be relative and stay inside its root", path.display()),
        ));
      }
    }
  }
  if path.file_name().is_none() {
    return Err(invalid(field, format!("{} does not name a file", path.display())));
  }
  Ok(())
}

/// Read a recipe document from disk. `.json` and `.toml` are supported.
///
/// Only deserialization happens here; call [`Recipe::validate`] (the pipeline
/// does) to check invariants.
pub fn load_recipe(path: &Path) -> Result<Recipe, RecipeError> {
  let content = std::fs::read_to_string(path).map_err(|source| RecipeError::Read {
    path: path.to_path_buf(),
    source,
  })?;

  let parse_err = |message: String| RecipeError::Parse {
    path: path.to_path_buf(),
    message,
  };

  match path.extension().and_then(|e| e.to_str()) {
    Some("json") => serde_json::from_str(&content).map_err(|e| parse_err(e.to_string())),
    Some("toml") => toml::from_str(&content).map_err(|e| parse_err(e.to_string())),
    _ => Err(RecipeError::UnsupportedFormat(path.to_path_buf())),
  }
}
