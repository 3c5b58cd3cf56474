//! Shared helpers for pipeline integration tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use kiln_lib::PipelineConfig;
use kiln_lib::fetch::FetchConfig;
use kiln_lib::pipeline::RecipePipeline;
use kiln_lib::recipe::{Artifact, OutputPattern, Recipe, SandboxPolicy};
use kiln_lib::verify::{Digest, HashAlgorithm, digest_bytes};
use mockito::{Mock, ServerGuard};
use tempfile::TempDir;

/// Build script used by most tests: installs the pre-written tool script as
/// `target/release/ocli`.
pub const BUILD_SH: &str = "#!/bin/sh\nset -e\nmkdir -p target/release\ncp ocli.in target/release/ocli\n";

/// A tool that prints `line` to stdout.
pub fn tool_script(line: &str) -> String {
  format!("#!/bin/sh\necho \"{line}\"\n")
}

/// `ocli-0.2.0/{build.sh, ocli.in, README.md}` as a tar.gz.
pub fn source_archive(build_sh: &str, tool: &str) -> Vec<u8> {
  let encoder = GzEncoder::new(Vec::new(), Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (path, data, mode) in [
    ("ocli-0.2.0/build.sh", build_sh.as_bytes(), 0o755),
    ("ocli-0.2.0/ocli.in", tool.as_bytes(), 0o644),
    ("ocli-0.2.0/README.md", b"# ocli\n".as_slice(), 0o644),
  ] {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap()
}

/// Default source: builds a tool printing `OCLI v0.2.0`.
pub fn ocli_source() -> Vec<u8> {
  source_archive(BUILD_SH, &tool_script("OCLI v0.2.0"))
}

pub fn sha256(bytes: &[u8]) -> Digest {
  digest_bytes(HashAlgorithm::Sha256, bytes)
}

/// Isolated environment: a temp root for cache, work dirs and the prefix,
/// plus a mock HTTP server for sources.
pub struct TestEnv {
  pub temp: TempDir,
  pub server: ServerGuard,
}

impl TestEnv {
  pub async fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
      server: mockito::Server::new_async().await,
    }
  }

  pub fn prefix(&self) -> PathBuf {
    self.temp.path().join("prefix")
  }

  pub fn config(&self) -> PipelineConfig {
    PipelineConfig {
      fetch: FetchConfig {
        timeout: Duration::from_secs(10),
        max_retries: 0,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        max_bytes: 16 * 1024 * 1024,
      },
      build_timeout: Duration::from_secs(30),
      test_timeout: Duration::from_secs(30),
      lock_timeout: Duration::from_secs(30),
      ..PipelineConfig::rooted_at(self.temp.path())
    }
  }

  pub fn pipeline(&self) -> RecipePipeline {
    RecipePipeline::new(self.config()).unwrap()
  }

  /// Serve `body` at `/ocli-0.2.0.tar.gz`.
  pub async fn serve(&mut self, body: &[u8]) -> Mock {
    self
      .server
      .mock("GET", "/ocli-0.2.0.tar.gz")
      .with_status(200)
      .with_body(body)
      .create_async()
      .await
  }

  pub fn source_url(&self) -> String {
    format!("{}/ocli-0.2.0.tar.gz", self.server.url())
  }

  /// The `ocli` v0.2.0 recipe against this environment.
  pub fn recipe(&self, digest: Digest) -> Recipe {
    Recipe {
      name: "ocli".to_string(),
      version: "0.2.0".to_string(),
      description: Some("Ollama Command Line Interface".to_string()),
      homepage: Some("https://github.com/wiseowltechnet/ollama-ocli".to_string()),
      license: Some("MIT".to_string()),
      source_url: self.source_url(),
      expected_digest: digest,
      build_command: vec!["/bin/sh".to_string(), "build.sh".to_string()],
      artifact_paths: vec![Artifact::executable("target/release/ocli"), Artifact::file("README.md")],
      install_prefix: self.prefix(),
      test_command: vec!["ocli".to_string(), "--version".to_string()],
      expected_output_pattern: OutputPattern::Literal("OCLI v0.2.0".to_string()),
      sandbox: SandboxPolicy::default(),
    }
  }
}

/// Every path under `dir`, relative and sorted. Empty if `dir` is missing.
pub fn listing(dir: &Path) -> Vec<String> {
  fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
      return;
    };
    for entry in entries.flatten() {
      let path = entry.path();
      out.push(path.strip_prefix(root).unwrap().display().to_string());
      if path.is_dir() {
        walk(root, &path, out);
      }
    }
  }
  let mut out = Vec::new();
  walk(dir, dir, &mut out);
  out.sort();
  out
}
