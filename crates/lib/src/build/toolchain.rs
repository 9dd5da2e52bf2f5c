//! The seam between the pipeline and external programs.
//!
//! Every external program the pipeline runs (configure scripts, compilers,
//! `make`, `git`) goes through a [`Toolchain`]. Production code uses
//! [`ProcessToolchain`]; tests substitute recording stand-ins.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::env::Environment;

/// A fully resolved program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
  /// Step name, for logs and errors.
  pub step: String,
  pub program: String,
  pub args: Vec<String>,
  pub cwd: PathBuf,
  /// The complete environment of the child. Nothing else is inherited.
  pub env: Environment,
}

impl Invocation {
  pub fn command_line(&self) -> String {
    std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

/// How an invocation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepStatus {
  pub success: bool,
  /// Exit code, `None` when the process was killed by a signal.
  pub code: Option<i32>,
}

impl StepStatus {
  pub fn ok() -> Self {
    Self {
      success: true,
      code: Some(0),
    }
  }

  pub fn failed(code: i32) -> Self {
    Self {
      success: false,
      code: Some(code),
    }
  }
}

impl std::fmt::Display for StepStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self.code {
      Some(code) => write!(f, "exit code {code}"),
      None => f.write_str("terminated by signal"),
    }
  }
}

pub trait Toolchain: Send + Sync {
  /// Run `invocation` to completion.
  ///
  /// `Err` is reserved for failures to start the program; a program that
  /// runs and exits non-zero is reported through [`StepStatus`].
  fn invoke(&self, invocation: &Invocation) -> impl Future<Output = io::Result<StepStatus>> + Send;
}

/// Runs invocations as child processes.
///
/// Children are killed if the future driving them is dropped, so a cancelled
/// or timed-out run does not leave builds running in the background.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessToolchain {
  /// Capture child output and only surface it on failure.
  pub quiet: bool,
}

impl Toolchain for ProcessToolchain {
  async fn invoke(&self, invocation: &Invocation) -> io::Result<StepStatus> {
    debug!(step = %invocation.step, cwd = %invocation.cwd.display(), cmd = %invocation.command_line(), "spawning process");

    let mut command = Command::new(&invocation.program);
    command
      .args(&invocation.args)
      .current_dir(&invocation.cwd)
      .env_clear()
      .envs(invocation.env.iter())
      .stdin(Stdio::null())
      .kill_on_drop(true);

    let status = if self.quiet {
      let output = command.output().await?;
      if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.is_empty() {
          warn!(step = %invocation.step, stdout = %tail(&stdout, 40), "step stdout");
        }
        if !stderr.is_empty() {
          warn!(step = %invocation.step, stderr = %tail(&stderr, 40), "step stderr");
        }
      }
      output.status
    } else {
      command.status().await?
    };

    Ok(StepStatus {
      success: status.success(),
      code: status.code(),
    })
  }
}

fn tail(text: &str, lines: usize) -> String {
  let all: Vec<&str> = text.lines().collect();
  all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn sh(script: &str, cwd: PathBuf, env: Environment) -> Invocation {
    Invocation {
      step: "test".to_string(),
      program: "/bin/sh".to_string(),
      args: vec!["-c".to_string(), script.to_string()],
      cwd,
      env,
    }
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn process_reports_success() {
    let temp = TempDir::new().unwrap();
    let status = ProcessToolchain { quiet: true }
      .invoke(&sh("true", temp.path().to_path_buf(), Environment::new()))
      .await
      .unwrap();
    assert_eq!(status, StepStatus::ok());
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn process_reports_exit_code() {
    let temp = TempDir::new().unwrap();
    let status = ProcessToolchain { quiet: true }
      .invoke(&sh("exit 3", temp.path().to_path_buf(), Environment::new()))
      .await
      .unwrap();
    assert_eq!(status, StepStatus::failed(3));
  }

  #[tokio::test]
  #[cfg(unix)]
  async fn process_sees_only_given_environment() {
    let temp = TempDir::new().unwrap();
    let env: Environment = [("ONLY_THIS", "yes")].into_iter().collect();
    let script = r#"test "$ONLY_THIS" = yes && test -z "$HOME" && : > marker"#;

    let status = ProcessToolchain { quiet: true }
      .invoke(&sh(script, temp.path().to_path_buf(), env))
      .await
      .unwrap();

    assert!(status.success);
    assert!(temp.path().join("marker").exists());
  }

  #[tokio::test]
  async fn missing_program_is_spawn_error() {
    let temp = TempDir::new().unwrap();
    let invocation = Invocation {
      step: "missing".to_string(),
      program: "/nonexistent/nativeboot-no-such-tool".to_string(),
      args: Vec::new(),
      cwd: temp.path().to_path_buf(),
      env: Environment::new(),
    };
    assert!(ProcessToolchain::default().invoke(&invocation).await.is_err());
  }

  #[test]
  fn command_line_joins_args() {
    let invocation = sh("echo hi", PathBuf::from("/"), Environment::new());
    assert_eq!(invocation.command_line(), "/bin/sh -c echo hi");
  }

  #[test]
  fn tail_keeps_last_lines() {
    assert_eq!(tail("a\nb\nc", 2), "b\nc");
    assert_eq!(tail("a", 5), "a");
  }
}
