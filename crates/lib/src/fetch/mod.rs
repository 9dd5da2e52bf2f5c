//! Source acquisition for a build spec.
//!
//! Archives are trusted by their pinned digest, revisions by their exact
//! identity. Either way the sources land in a directory the caller owns,
//! normally inside the run's workspace.

pub mod archive;
pub mod revision;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::build::toolchain::{StepStatus, Toolchain};
use crate::build::types::SourceLocator;
use crate::consts::APP_NAME;
use crate::env::Environment;
use crate::integrity::IntegrityError;

pub use archive::{ArchiveFormat, fetch_archive};
pub use revision::fetch_revision;

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("failed to fetch {url}: {message}")]
  Http { url: String, message: String },

  #[error("failed to build HTTP client: {0}")]
  Client(#[source] reqwest::Error),

  #[error(transparent)]
  Integrity(#[from] IntegrityError),

  #[error("unsupported archive format: {0} (expected .tar.gz, .tgz, .tar.xz, .txz or .tar)")]
  UnsupportedArchive(String),

  #[error("failed to unpack archive: {0}")]
  Unpack(#[source] std::io::Error),

  #[error("archive entry escapes the destination: {0}")]
  UnsafeEntry(String),

  #[error("{step} failed with {status}")]
  Git { step: String, status: StepStatus },

  #[error("{step} could not start git: {source}")]
  GitSpawn {
    step: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{step} timed out after {}", humantime::format_duration(*.after))]
  GitTimedOut { step: String, after: Duration },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Fetches the source a [`SourceLocator`] points at.
#[derive(Debug, Clone)]
pub struct Fetcher {
  client: reqwest::Client,
  timeout: Option<Duration>,
}

impl Fetcher {
  /// `timeout` bounds each HTTP request and each `git` command.
  pub fn new(timeout: Option<Duration>) -> Result<Self, FetchError> {
    let mut builder = reqwest::Client::builder().user_agent(format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION")));
    if let Some(limit) = timeout {
      builder = builder.timeout(limit);
    }
    let client = builder.build().map_err(FetchError::Client)?;
    Ok(Self { client, timeout })
  }

  /// Fetch `locator` into `dest` and return the source root.
  ///
  /// `env` is only used for `git`; archive fetches run in-process.
  pub async fn fetch<T: Toolchain>(
    &self,
    locator: &SourceLocator,
    dest: &Path,
    toolchain: &T,
    env: &Environment,
  ) -> Result<PathBuf, FetchError> {
    match locator {
      SourceLocator::Archive { url, sha256 } => fetch_archive(&self.client, url, sha256, dest).await,
      SourceLocator::Revision { url, rev, submodules } => {
        fetch_revision(toolchain, env, url, rev, *submodules, dest, self.timeout).await
      }
    }
  }
}
