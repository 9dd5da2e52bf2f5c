//! Implementation of the `nativeboot index` command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use nativeboot_lib::config::{Config, Overrides};
use nativeboot_lib::publish::{ArtifactClass, IndexEntry, IndexOptions, Store, collect, fetch_index, read_index};

use crate::output::{OutputFormat, print_info, print_json, print_stat, print_success};

/// Where the already-published index comes from.
pub enum History {
  Mirror(String),
  File(PathBuf),
  /// A mirror that has never been published to.
  Empty,
}

pub fn cmd_index(
  dist: &Path,
  dest: &Path,
  history: History,
  uploaded_by: Option<String>,
  timestamp: Option<u64>,
  output: OutputFormat,
) -> Result<()> {
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;

  let previous: Vec<IndexEntry> = match &history {
    History::Mirror(url) => {
      let config = Config::resolve(Overrides::default()).context("config")?;
      let store = Store::connect(url, config.fetch_timeout, config.store_token).context("index")?;
      match rt.block_on(fetch_index(&store)).context("index")? {
        Some(entries) => entries,
        None => bail!("index: {url} has no packages.json; pass --new-mirror to start a new mirror"),
      }
    }
    History::File(path) => read_index(path).context("index")?,
    History::Empty => Vec::new(),
  };

  let options = match (uploaded_by, timestamp) {
    (Some(uploaded_by), Some(timestamp)) => IndexOptions { uploaded_by, timestamp },
    (uploaded_by, timestamp) => {
      let cwd = std::env::current_dir().context("index")?;
      let commit = rt
        .block_on(IndexOptions::from_git(&cwd))
        .context("index: pass --uploaded-by and --timestamp outside a git checkout")?;
      IndexOptions {
        uploaded_by: uploaded_by.unwrap_or(commit.uploaded_by),
        timestamp: timestamp.unwrap_or(commit.timestamp),
      }
    }
  };

  let manifest = collect(dist, dest, &previous, &options).context("index")?;

  if output.is_json() {
    return print_json(&manifest);
  }

  let new = manifest
    .entries()
    .iter()
    .filter(|e| e.class == ArtifactClass::ImmutableBinary)
    .count();
  if new == 0 {
    print_info(&format!("no new artifacts in {}", dist.display()));
  } else {
    print_success(&format!("staged {} new artifact(s) into {}", new, dest.display()));
  }
  print_stat("Previously published", &previous.len().to_string());
  print_stat("Objects to publish", &manifest.len().to_string());

  Ok(())
}
