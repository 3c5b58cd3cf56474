//! Running build and test commands.
//!
//! Commands are started directly (no shell) with a cleared environment, their
//! own process group, and a wall-clock timeout. On timeout or cancellation the
//! whole group is killed so stray grandchildren do not outlive the run.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::consts::{DEFAULT_SANDBOX_PATH, SOURCE_DATE_EPOCH};
use crate::recipe::SandboxPolicy;

/// How long to wait for output pipes to close after the process group was killed.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ProcessSpec {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: PathBuf,
  pub env: BTreeMap<String, String>,
  pub timeout: Duration,
}

impl ProcessSpec {
  /// Build a spec from an argv-style command. `command` must not be empty.
  pub fn from_argv(command: &[String], cwd: impl Into<PathBuf>, env: BTreeMap<String, String>, timeout: Duration) -> Self {
    let (program, args) = command.split_first().map(|(p, a)| (p.clone(), a.to_vec())).unwrap_or_default();
    Self {
      program,
      args,
      cwd: cwd.into(),
      env,
      timeout,
    }
  }

  pub fn display(&self) -> String {
    std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
  /// `None` when the process was terminated by a signal.
  pub exit_code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
  pub duration: Duration,
}

impl ProcessOutput {
  pub fn success(&self) -> bool {
    self.exit_code == Some(0)
  }

  /// Stdout followed by stderr.
  pub fn combined(&self) -> String {
    let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
    out.push_str(&self.stdout);
    out.push_str(&self.stderr);
    out
  }
}

#[derive(Debug, Error)]
pub enum ProcessError {
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: io::Error,
  },

  #[error("{program} timed out after {timeout:?}")]
  Timeout { program: String, timeout: Duration },

  #[error("{program} cancelled")]
  Cancelled { program: String },

  #[error("failed waiting for {program}: {source}")]
  Io {
    program: String,
    #[source]
    source: io::Error,
  },
}

/// Environment for sandboxed commands.
///
/// Starts empty, then sets:
/// - `PATH` to a fixed system path (or the host's, if passed through)
/// - `HOME` and the temp-dir variables to the workspace
/// - `LANG`/`LC_ALL` to `C`
/// - `SOURCE_DATE_EPOCH` for reproducible timestamps
///
/// Variables named in `policy.pass_env` are copied from the host, then
/// `policy.env` is applied. `extra_path` is prepended to `PATH` last.
pub fn isolated_env(home: &Path, tmp: &Path, policy: &SandboxPolicy, extra_path: Option<&Path>) -> BTreeMap<String, String> {
  let mut env = BTreeMap::new();
  let tmp = tmp.display().to_string();

  env.insert("PATH".to_string(), DEFAULT_SANDBOX_PATH.to_string());
  env.insert("HOME".to_string(), home.display().to_string());
  for var in ["TMPDIR", "TMP", "TEMP", "TEMPDIR"] {
    env.insert(var.to_string(), tmp.clone());
  }
  env.insert("LANG".to_string(), "C".to_string());
  env.insert("LC_ALL".to_string(), "C".to_string());
  env.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());

  for name in &policy.pass_env {
    if let Ok(value) = std::env::var(name) {
      env.insert(name.clone(), value);
    }
  }
  for (key, value) in &policy.env {
    env.insert(key.clone(), value.clone());
  }

  if let Some(dir) = extra_path {
    let path = match env.get("PATH") {
      Some(existing) if !existing.is_empty() => format!("{}:{}", dir.display(), existing),
      _ => dir.display().to_string(),
    };
    env.insert("PATH".to_string(), path);
  }

  env
}

/// Run `spec` to completion, capturing stdout and stderr.
///
/// A non-zero exit is not an error here; callers decide what it means.
pub async fn run(spec: &ProcessSpec, cancel: &CancellationToken) -> Result<ProcessOutput, ProcessError> {
  let program = spec.program.clone();
  debug!(command = %spec.display(), cwd = ?spec.cwd, timeout = ?spec.timeout, "spawning process");

  let mut command = Command::new(resolve_program(&spec.program, &spec.cwd));
  command
    .args(&spec.args)
    .current_dir(&spec.cwd)
    .env_clear()
    .envs(&spec.env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  #[cfg(unix)]
  {
    command.process_group(0);
  }

  let started = Instant::now();
  let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
    program: program.clone(),
    source,
  })?;

  let stdout = child.stdout.take().map(drain);
  let stderr = child.stderr.take().map(drain);

  let status = tokio::select! {
    status = child.wait() => Some(status),
    _ = tokio::time::sleep(spec.timeout) => None,
    _ = cancel.cancelled() => None,
  };

  let status = match status {
    Some(status) => status.map_err(|source| ProcessError::Io {
      program: program.clone(),
      source,
    })?,
    None => {
      let cancelled = cancel.is_cancelled();
      warn!(command = %spec.display(), cancelled, "killing process group");
      terminate(&mut child).await;
      collect(stdout).await;
      collect(stderr).await;
      return Err(if cancelled {
        ProcessError::Cancelled { program }
      } else {
        ProcessError::Timeout {
          program,
          timeout: spec.timeout,
        }
      });
    }
  };

  let output = ProcessOutput {
    exit_code: status.code(),
    stdout: collect(stdout).await,
    stderr: collect(stderr).await,
    duration: started.elapsed(),
  };
  debug!(command = %spec.display(), exit_code = ?output.exit_code, duration = ?output.duration, "process finished");
  Ok(output)
}

/// Relative paths with a directory part (`./build.sh`) are taken relative to
/// the command's working directory. Bare names are looked up on `PATH`.
fn resolve_program(program: &str, cwd: &Path) -> PathBuf {
  let path = Path::new(program);
  if path.is_relative() && path.components().count() > 1 {
    cwd.join(path)
  } else {
    path.to_path_buf()
  }
}

fn drain<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  tokio::spawn(async move {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf
  })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
  let Some(handle) = handle else {
    return String::new();
  };
  let abort = handle.abort_handle();
  match tokio::time::timeout(PIPE_DRAIN_GRACE, handle).await {
    Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
    Ok(Err(_)) => String::new(),
    Err(_) => {
      // Something outside the process group still holds the pipe.
      abort.abort();
      String::new()
    }
  }
}

async fn terminate(child: &mut Child) {
  #[cfg(unix)]
  {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Some(pid) = child.id()
      && let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
    {
      debug!(pid, error = %e, "killpg failed");
    }
  }
  let _ = child.kill().await;
}

/// The last `lines` lines of `text`.
pub fn output_tail(text: &str, lines: usize) -> String {
  let all: Vec<&str> = text.lines().collect();
  let start = all.len().saturating_sub(lines);
  all[start..].join("\n")
}
