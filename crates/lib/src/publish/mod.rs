//! Publication of a staged mirror tree.
//!
//! Objects are uploaded class by class: immutable artifacts first, then
//! mutable pages, then the authoritative index. A class only starts once the
//! previous one fully succeeded, so a reader that sees a new index entry can
//! always fetch the artifact it names.

pub mod index;
pub mod store;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::consts::{ARTIFACT_DIR, DEFAULT_UPLOAD_JOBS, INDEX_FILE};

pub use index::{IndexEntry, IndexError, IndexOptions, collect, fetch_index, read_index};
pub use store::{HttpStore, LocalStore, ObjectStore, Store, StoreError};

/// Publication class, in upload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactClass {
  /// Content-addressed by name; never overwritten once present.
  ImmutableBinary,
  /// Regenerated pages; always overwritten.
  MutablePage,
  /// The single index readers consult first; written last.
  AuthoritativeIndex,
}

impl ArtifactClass {
  pub fn cache_directive(&self) -> CacheDirective {
    match self {
      ArtifactClass::ImmutableBinary => CacheDirective::Long,
      ArtifactClass::MutablePage => CacheDirective::Short,
      ArtifactClass::AuthoritativeIndex => CacheDirective::None,
    }
  }
}

impl fmt::Display for ArtifactClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      ArtifactClass::ImmutableBinary => "immutable",
      ArtifactClass::MutablePage => "mutable",
      ArtifactClass::AuthoritativeIndex => "index",
    };
    f.write_str(s)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheDirective {
  Long,
  Short,
  None,
}

impl CacheDirective {
  /// The `Cache-Control` header value.
  pub fn header_value(&self) -> &'static str {
    match self {
      CacheDirective::Long => "public, max-age=3600",
      CacheDirective::Short => "public, max-age=300",
      CacheDirective::None => "no-cache, max-age=0, must-revalidate",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
  pub class: ArtifactClass,
  /// Slash-separated path relative to the source root and the store.
  pub path: String,
  pub cache: CacheDirective,
}

impl ManifestEntry {
  pub fn new(class: ArtifactClass, path: impl Into<String>) -> Self {
    Self {
      class,
      path: path.into(),
      cache: class.cache_directive(),
    }
  }
}

/// The objects to publish, sorted by class and then path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PublishManifest {
  entries: Vec<ManifestEntry>,
}

impl PublishManifest {
  pub fn new(mut entries: Vec<ManifestEntry>) -> Self {
    entries.sort_by(|a, b| (a.class, &a.path).cmp(&(b.class, &b.path)));
    Self { entries }
  }

  /// Classify every file under `root`: `wheels/**` is immutable,
  /// `packages.json` is the index, everything else is a mutable page.
  pub fn from_tree(root: &Path) -> Result<Self, PublishError> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
      let entry = entry.map_err(|e| PublishError::Walk(e.to_string()))?;
      if entry.file_type().is_dir() {
        continue;
      }
      let Ok(rel) = entry.path().strip_prefix(root) else {
        continue;
      };

      let path = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
      entries.push(ManifestEntry::new(classify(&path), path));
    }

    Ok(Self::new(entries))
  }

  pub fn entries(&self) -> &[ManifestEntry] {
    &self.entries
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  fn class(&self, class: ArtifactClass) -> impl Iterator<Item = &ManifestEntry> {
    self.entries.iter().filter(move |e| e.class == class)
  }
}

fn classify(path: &str) -> ArtifactClass {
  if path == INDEX_FILE {
    ArtifactClass::AuthoritativeIndex
  } else if path.split('/').next() == Some(ARTIFACT_DIR) {
    ArtifactClass::ImmutableBinary
  } else {
    ArtifactClass::MutablePage
  }
}

#[derive(Debug, Error)]
pub enum PublishError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("failed to read {}: {source}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to scan staged tree: {0}")]
  Walk(String),

  #[error("upload task failed: {0}")]
  Task(String),

  #[error(transparent)]
  Index(#[from] IndexError),

  #[error("staged packages.json drops {count} entries the store already lists, starting with {first}")]
  IndexRegression { count: usize, first: String },
}

#[derive(Debug, Clone, Copy)]
pub struct PublishOptions {
  pub dry_run: bool,
  /// Concurrent uploads within one class.
  pub jobs: usize,
}

impl Default for PublishOptions {
  fn default() -> Self {
    Self {
      dry_run: false,
      jobs: DEFAULT_UPLOAD_JOBS,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationOutcome {
  /// Dry run: would be uploaded.
  Planned,
  Uploaded,
  /// Immutable object already present in the store.
  SkippedExisting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operation {
  pub path: String,
  pub class: ArtifactClass,
  pub cache_control: &'static str,
  pub outcome: OperationOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishReport {
  pub dry_run: bool,
  pub operations: Vec<Operation>,
}

impl PublishReport {
  pub fn count(&self, outcome: OperationOutcome) -> usize {
    self.operations.iter().filter(|op| op.outcome == outcome).count()
  }
}

/// Upload the objects in `manifest`, read from `source_root`, to `store`.
///
/// An empty manifest is a no-op. Before anything is written, a staged index
/// is checked to still list every file the store's current index lists. A
/// dry run reports the operations a real run would perform, consulting the
/// store only to see which immutable objects already exist. The first
/// failure aborts the remaining uploads of its class and every later class.
pub async fn publish<S>(
  manifest: &PublishManifest,
  source_root: &Path,
  store: Arc<S>,
  options: PublishOptions,
) -> Result<PublishReport, PublishError>
where
  S: ObjectStore + 'static,
{
  let mut report = PublishReport {
    dry_run: options.dry_run,
    operations: Vec::new(),
  };

  if manifest.is_empty() {
    info!("nothing to publish");
    return Ok(report);
  }

  check_index_history(manifest, source_root, store.as_ref()).await?;

  if options.dry_run {
    for entry in manifest.entries() {
      let outcome = if entry.class == ArtifactClass::ImmutableBinary && store.exists(&entry.path).await? {
        OperationOutcome::SkippedExisting
      } else {
        OperationOutcome::Planned
      };
      report.operations.push(Operation {
        path: entry.path.clone(),
        class: entry.class,
        cache_control: entry.cache.header_value(),
        outcome,
      });
    }
    return Ok(report);
  }

  let permits = Arc::new(Semaphore::new(options.jobs.max(1)));

  for class in [
    ArtifactClass::ImmutableBinary,
    ArtifactClass::MutablePage,
    ArtifactClass::AuthoritativeIndex,
  ] {
    let entries: Vec<ManifestEntry> = manifest.class(class).cloned().collect();
    if entries.is_empty() {
      continue;
    }
    info!(class = %class, objects = entries.len(), "publishing class");

    let mut tasks = JoinSet::new();
    for entry in entries {
      let store = Arc::clone(&store);
      let permits = Arc::clone(&permits);
      let file = entry.path.split('/').fold(source_root.to_path_buf(), |acc, p| acc.join(p));
      tasks.spawn(async move {
        let _permit = permits
          .acquire_owned()
          .await
          .map_err(|e| PublishError::Task(e.to_string()))?;
        upload(store.as_ref(), &entry, &file).await
      });
    }

    let mut done = Vec::new();
    while let Some(joined) = tasks.join_next().await {
      let result = joined.map_err(|e| PublishError::Task(e.to_string())).and_then(|r| r);
      match result {
        Ok(op) => done.push(op),
        Err(err) => {
          tasks.abort_all();
          return Err(err);
        }
      }
    }

    done.sort_by(|a, b| a.path.cmp(&b.path));
    report.operations.extend(done);
  }

  info!(
    uploaded = report.count(OperationOutcome::Uploaded),
    skipped = report.count(OperationOutcome::SkippedExisting),
    "publish complete"
  );
  Ok(report)
}

/// Fail when the staged index no longer lists a file the store's current
/// index does.
async fn check_index_history<S: ObjectStore>(
  manifest: &PublishManifest,
  source_root: &Path,
  store: &S,
) -> Result<(), PublishError> {
  if manifest.class(ArtifactClass::AuthoritativeIndex).next().is_none() {
    return Ok(());
  }
  let Some(current) = fetch_index(store).await? else {
    return Ok(());
  };

  let staged = read_index(&source_root.join(INDEX_FILE))?;
  let staged: HashSet<&str> = staged.iter().map(|e| e.filename.as_str()).collect();
  let missing: Vec<&str> = current
    .iter()
    .map(|e| e.filename.as_str())
    .filter(|name| !staged.contains(name))
    .collect();

  match missing.first() {
    Some(first) => Err(PublishError::IndexRegression {
      count: missing.len(),
      first: first.to_string(),
    }),
    None => Ok(()),
  }
}

async fn upload<S: ObjectStore>(store: &S, entry: &ManifestEntry, file: &Path) -> Result<Operation, PublishError> {
  let op = |outcome| Operation {
    path: entry.path.clone(),
    class: entry.class,
    cache_control: entry.cache.header_value(),
    outcome,
  };

  if entry.class == ArtifactClass::ImmutableBinary && store.exists(&entry.path).await? {
    debug!(path = %entry.path, "already published");
    return Ok(op(OperationOutcome::SkippedExisting));
  }

  let body = tokio::fs::read(file).await.map_err(|source| PublishError::Read {
    path: file.to_path_buf(),
    source,
  })?;
  store.put(&entry.path, body, entry.cache).await?;
  debug!(path = %entry.path, class = %entry.class, "uploaded");
  Ok(op(OperationOutcome::Uploaded))
}
