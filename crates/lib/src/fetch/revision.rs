//! Source checkout at an exact revision.
//!
//! A shallow fetch of a single revision followed by a detached checkout,
//! optionally with submodules. Runs `git` through the same [`Toolchain`] seam
//! as build steps so it can be observed and stubbed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use super::FetchError;
use crate::build::toolchain::{Invocation, Toolchain};
use crate::env::Environment;

const GIT: &str = "git";

/// The `git` commands that check out `rev` of `url`, in order.
pub fn commands(url: &str, rev: &str, submodules: bool) -> Vec<(&'static str, Vec<String>)> {
  let args = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();

  let mut commands = vec![
    ("git-init", args(&["init", "--quiet"])),
    ("git-remote", args(&["remote", "add", "origin", url])),
    ("git-fetch", args(&["fetch", "--quiet", "--depth", "1", "origin", rev])),
    ("git-checkout", args(&["checkout", "--quiet", "--detach", "FETCH_HEAD"])),
  ];

  if submodules {
    commands.push((
      "git-submodules",
      args(&["submodule", "update", "--quiet", "--init", "--recursive", "--depth", "1"]),
    ));
  }

  commands
}

/// Check out `rev` of `url` into `dest` and return `dest`.
///
/// `env` is the environment `git` runs with; terminal credential prompts are
/// always disabled. Each command is bounded by `timeout` when given.
pub async fn fetch_revision<T: Toolchain>(
  toolchain: &T,
  env: &Environment,
  url: &str,
  rev: &str,
  submodules: bool,
  dest: &Path,
  timeout: Option<Duration>,
) -> Result<PathBuf, FetchError> {
  info!(url = %url, rev = %rev, submodules, "fetching revision");
  tokio::fs::create_dir_all(dest).await?;

  let mut env = env.clone();
  env.set("GIT_TERMINAL_PROMPT", "0");

  for (step, args) in commands(url, rev, submodules) {
    let invocation = Invocation {
      step: step.to_string(),
      program: GIT.to_string(),
      args,
      cwd: dest.to_path_buf(),
      env: env.clone(),
    };
    debug!(cmd = %invocation.command_line(), "git");

    let status = match timeout {
      Some(limit) => tokio::time::timeout(limit, toolchain.invoke(&invocation))
        .await
        .map_err(|_| FetchError::GitTimedOut {
          step: step.to_string(),
          after: limit,
        })?,
      None => toolchain.invoke(&invocation).await,
    }
    .map_err(|source| FetchError::GitSpawn {
      step: step.to_string(),
      source,
    })?;

    if !status.success {
      return Err(FetchError::Git {
        step: step.to_string(),
        status,
      });
    }
  }

  info!(rev = %rev, dest = %dest.display(), "checked out revision");
  Ok(dest.to_path_buf())
}

#[cfg(test)]
mod tests {
  use std::io;
  use std::sync::Mutex;

  use super::*;
  use crate::build::toolchain::StepStatus;
  use tempfile::TempDir;

  #[derive(Default)]
  struct RecordingGit {
    calls: Mutex<Vec<Invocation>>,
    fail_step: Option<&'static str>,
  }

  impl Toolchain for RecordingGit {
    async fn invoke(&self, invocation: &Invocation) -> io::Result<StepStatus> {
      self.calls.lock().unwrap().push(invocation.clone());
      if self.fail_step == Some(invocation.step.as_str()) {
        return Ok(StepStatus::failed(128));
      }
      Ok(StepStatus::ok())
    }
  }

  const URL: &str = "https://github.com/python/cpython.git";
  const REV: &str = "v3.13.1";

  #[tokio::test]
  async fn checks_out_detached_revision() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("src");
    let git = RecordingGit::default();
    let env: Environment = [("PATH", "/usr/bin")].into_iter().collect();

    let root = fetch_revision(&git, &env, URL, REV, false, &dest, None).await.unwrap();

    assert_eq!(root, dest);
    assert!(dest.is_dir());

    let calls = git.calls.lock().unwrap();
    let lines: Vec<_> = calls.iter().map(|c| c.command_line()).collect();
    assert_eq!(
      lines,
      [
        "git init --quiet".to_string(),
        format!("git remote add origin {URL}"),
        format!("git fetch --quiet --depth 1 origin {REV}"),
        "git checkout --quiet --detach FETCH_HEAD".to_string(),
      ]
    );
    assert!(calls.iter().all(|c| c.cwd == dest));
    assert!(calls.iter().all(|c| c.env.get("GIT_TERMINAL_PROMPT") == Some("0")));
    assert!(calls.iter().all(|c| c.env.get("PATH") == Some("/usr/bin")));
  }

  #[tokio::test]
  async fn submodules_are_opt_in() {
    let temp = TempDir::new().unwrap();
    let git = RecordingGit::default();

    fetch_revision(&git, &Environment::new(), URL, REV, true, temp.path(), None)
      .await
      .unwrap();

    let calls = git.calls.lock().unwrap();
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[4].step, "git-submodules");
    assert!(calls[4].args.contains(&"--recursive".to_string()));
  }

  #[tokio::test]
  async fn failed_fetch_stops_before_checkout() {
    let temp = TempDir::new().unwrap();
    let git = RecordingGit {
      fail_step: Some("git-fetch"),
      ..Default::default()
    };

    let err = fetch_revision(&git, &Environment::new(), URL, "deadbeef", true, temp.path(), None)
      .await
      .unwrap_err();

    assert!(matches!(err, FetchError::Git { ref step, .. } if step == "git-fetch"));
    assert_eq!(git.calls.lock().unwrap().len(), 3);
  }
}
