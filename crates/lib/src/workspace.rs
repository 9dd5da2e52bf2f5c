//! Ephemeral build workspaces.
//!
//! Each pipeline run gets its own uniquely named temporary directory. The
//! directory is owned by a [`Workspace`] value and is removed when that value
//! is dropped, which covers normal return, error return, unwinding panics and
//! cancellation of the run's future.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::consts::WORKSPACE_PREFIX;

/// An exclusively owned temporary directory tree.
#[derive(Debug)]
pub struct Workspace {
  dir: TempDir,
}

impl Workspace {
  /// Allocate a new workspace under `root`, or under the system temp
  /// directory when `root` is `None`.
  pub fn create(root: Option<&Path>) -> io::Result<Self> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(WORKSPACE_PREFIX);

    let dir = match root {
      Some(root) => {
        std::fs::create_dir_all(root)?;
        builder.tempdir_in(root)?
      }
      None => builder.tempdir()?,
    };

    debug!(path = %dir.path().display(), "created workspace");
    Ok(Self { dir })
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Remove the workspace, reporting any error instead of swallowing it.
  pub fn close(self) -> io::Result<()> {
    let path = self.dir.path().to_path_buf();
    self.dir.close()?;
    debug!(path = %path.display(), "removed workspace");
    Ok(())
  }
}

/// Run `f` inside a fresh workspace and remove the workspace afterwards.
///
/// The workspace is removed whether `f` succeeds or fails. Removal errors
/// after a successful run are reported; after a failed run the original error
/// wins and the removal error is only logged.
pub async fn with_workspace<F, Fut, T, E>(root: Option<&Path>, f: F) -> Result<T, E>
where
  F: FnOnce(PathBuf) -> Fut,
  Fut: Future<Output = Result<T, E>>,
  E: From<io::Error>,
{
  let workspace = Workspace::create(root)?;
  let result = f(workspace.path().to_path_buf()).await;

  match result {
    Ok(value) => {
      workspace.close()?;
      Ok(value)
    }
    Err(err) => {
      let path = workspace.path().to_path_buf();
      if let Err(close_err) = workspace.close() {
        warn!(path = %path.display(), error = %close_err, "failed to remove workspace");
      }
      Err(err)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[tokio::test]
  async fn workspace_removed_after_success() {
    let root = TempDir::new().unwrap();
    let mut seen = None;

    let value: Result<u32, io::Error> = with_workspace(Some(root.path()), |path| {
      seen = Some(path.clone());
      async move {
        std::fs::write(path.join("scratch"), "x")?;
        Ok(7)
      }
    })
    .await;

    assert_eq!(value.unwrap(), 7);
    assert!(!seen.unwrap().exists());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn workspace_removed_after_failure() {
    let root = TempDir::new().unwrap();
    let mut seen = None;

    let result: Result<(), io::Error> = with_workspace(Some(root.path()), |path| {
      seen = Some(path.clone());
      async move {
        std::fs::create_dir_all(path.join("src/nested"))?;
        Err(io::Error::other("boom"))
      }
    })
    .await;

    assert_eq!(result.unwrap_err().to_string(), "boom");
    assert!(!seen.unwrap().exists());
  }

  #[tokio::test]
  async fn workspace_removed_when_future_dropped() {
    let root = TempDir::new().unwrap();
    let root_path = root.path().to_path_buf();
    let (tx, rx) = tokio::sync::oneshot::channel();

    let handle = tokio::spawn(async move {
      with_workspace(Some(&root_path), |path| async move {
        tx.send(path).unwrap();
        std::future::pending::<Result<(), io::Error>>().await
      })
      .await
    });
    let path = rx.await.unwrap();
    assert!(path.exists());

    handle.abort();
    let _ = handle.await;

    assert!(!path.exists());
  }

  #[test]
  fn workspace_removed_on_panic() {
    let root = TempDir::new().unwrap();
    let root_path = root.path().to_path_buf();

    let outcome = std::panic::catch_unwind(move || {
      let workspace = Workspace::create(Some(&root_path)).unwrap();
      std::fs::write(workspace.path().join("f"), "x").unwrap();
      panic!("abort mid-run");
    });

    assert!(outcome.is_err());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
  }

  #[test]
  fn concurrent_workspaces_are_distinct() {
    let root = TempDir::new().unwrap();
    let a = Workspace::create(Some(root.path())).unwrap();
    let b = Workspace::create(Some(root.path())).unwrap();

    assert_ne!(a.path(), b.path());
    assert!(
      a.path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with(WORKSPACE_PREFIX)
    );
  }
}
