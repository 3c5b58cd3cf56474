use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::verify::Digest;

/// A declarative description of how to fetch, verify, build, install and
/// test one package.
///
/// Recipes are immutable inputs: the pipeline only reads them. Produce one
/// with serde (JSON or TOML, see [`super::load_recipe`]) or construct it
/// directly in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
  pub name: String,
  pub version: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub homepage: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub license: Option<String>,

  /// Absolute http(s) URL of the source.
  pub source_url: String,
  pub expected_digest: Digest,

  /// Program and arguments, run without a shell from the extraction root.
  pub build_command: Vec<String>,

  /// Artifacts to install, in order, relative to the extraction root.
  pub artifact_paths: Vec<Artifact>,

  /// Absolute directory that receives the artifacts.
  pub install_prefix: PathBuf,

  /// Smoke test, run against the installed artifacts.
  pub test_command: Vec<String>,
  pub expected_output_pattern: OutputPattern,

  /// Execution opt-ins. The default is the most restrictive policy.
  #[serde(default)]
  pub sandbox: SandboxPolicy,
}

impl Recipe {
  /// `<name>-<version>`, used for logging and work directory names.
  pub fn label(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
  File,
  #[default]
  Executable,
}

/// A file produced by the build that must be installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ArtifactRepr")]
pub struct Artifact {
  /// Path relative to the extraction root.
  pub path: PathBuf,
  pub kind: ArtifactKind,
  /// Destination relative to the install prefix.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dest: Option<PathBuf>,
}

impl Artifact {
  pub fn executable(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: ArtifactKind::Executable,
      dest: None,
    }
  }

  pub fn file(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      kind: ArtifactKind::File,
      dest: None,
    }
  }

  pub fn with_dest(mut self, dest: impl Into<PathBuf>) -> Self {
    self.dest = Some(dest.into());
    self
  }

  /// Destination relative to the install prefix.
  ///
  /// Executables default to `bin/<file name>`, other files to
  /// `share/<recipe>/<file name>`.
  pub fn destination(&self, recipe_name: &str) -> PathBuf {
    if let Some(dest) = &self.dest {
      return dest.clone();
    }
    let file_name = self.path.file_name().map(PathBuf::from).unwrap_or_else(|| self.path.clone());
    match self.kind {
      ArtifactKind::Executable => Path::new("bin").join(file_name),
      ArtifactKind::File => Path::new("share").join(recipe_name).join(file_name),
    }
  }
}

/// Serialized forms: a bare path (an executable) or a table.
#[derive(Deserialize)]
#[serde(untagged)]
enum ArtifactRepr {
  Path(PathBuf),
  Full {
    path: PathBuf,
    #[serde(default)]
    kind: ArtifactKind,
    #[serde(default)]
    dest: Option<PathBuf>,
  },
}

impl From<ArtifactRepr> for Artifact {
  fn from(value: ArtifactRepr) -> Self {
    match value {
      ArtifactRepr::Path(path) => Artifact::executable(path),
      ArtifactRepr::Full { path, kind, dest } => Artifact { path, kind, dest },
    }
  }
}

/// What the smoke test's output must contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "PatternRepr")]
pub enum OutputPattern {
  Literal(String),
  Regex(String),
}

impl OutputPattern {
  /// Check `output` against the pattern.
  pub fn matches(&self, output: &str) -> Result<bool, regex::Error> {
    match self {
      OutputPattern::Literal(needle) => Ok(output.contains(needle.as_str())),
      OutputPattern::Regex(pattern) => Ok(Regex::new(pattern)?.is_match(output)),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      OutputPattern::Literal(s) | OutputPattern::Regex(s) => s,
    }
  }
}

impl std::fmt::Display for OutputPattern {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      OutputPattern::Literal(s) => write!(f, "{:?}", s),
      OutputPattern::Regex(s) => write!(f, "/{}/", s),
    }
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PatternRepr {
  Bare(String),
  Tagged(TaggedPattern),
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaggedPattern {
  Literal(String),
  Regex(String),
}

impl From<PatternRepr> for OutputPattern {
  fn from(value: PatternRepr) -> Self {
    match value {
      PatternRepr::Bare(s) | PatternRepr::Tagged(TaggedPattern::Literal(s)) => OutputPattern::Literal(s),
      PatternRepr::Tagged(TaggedPattern::Regex(s)) => OutputPattern::Regex(s),
    }
  }
}

/// Explicit, audited opt-ins to a broader execution environment for the
/// build and test commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
  /// Host environment variables passed through (e.g. `PATH`, `CARGO_HOME`).
  pub pass_env: Vec<String>,
  /// Extra variables set for the commands.
  pub env: BTreeMap<String, String>,
  /// The commands need network access.
  pub allow_network: bool,
}

impl SandboxPolicy {
  /// True when nothing beyond the default isolated environment is requested.
  pub fn is_default(&self) -> bool {
    self == &SandboxPolicy::default()
  }
}
