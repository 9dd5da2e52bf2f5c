//! Staging of built artifacts into a mirror tree.
//!
//! The tree has three parts: `wheels/` with the artifacts themselves,
//! `simple/` with one HTML page per project plus a root page, and
//! `packages.json`, one JSON object per line, which is the authoritative list
//! of everything the mirror has ever published.
//!
//! New entries carry the wheel's `Requires-Dist` and `Requires-Python`
//! metadata and the identity of the commit that staged them.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use super::store::{ObjectStore, StoreError};
use super::{ArtifactClass, ManifestEntry, PublishManifest};
use crate::consts::{ARTIFACT_DIR, INDEX_FILE, PAGES_DIR};
use crate::integrity::{self, IntegrityError};

#[derive(Debug, Error)]
pub enum IndexError {
  #[error("{0}: already published in the previous index")]
  AlreadyPublished(String),

  #[error("{}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to scan {}: {message}", .path.display())]
  Walk { path: PathBuf, message: String },

  #[error("invalid index line {line}: {source}")]
  Parse {
    line: usize,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to encode index entry: {0}")]
  Encode(#[source] serde_json::Error),

  #[error(transparent)]
  Hash(#[from] IntegrityError),

  #[error("{}: unreadable wheel metadata: {message}", .path.display())]
  Metadata { path: PathBuf, message: String },

  #[error("cannot determine upload identity from git: {0}")]
  Commit(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// One line of `packages.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
  pub filename: String,
  /// `sha256=<hex>`.
  pub hash: String,
  pub upload_timestamp: u64,
  pub uploaded_by: String,
  /// `requires_dist`, `requires_python` and fields written by other tools,
  /// carried through untouched.
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl IndexEntry {
  pub fn digest(&self) -> Option<&str> {
    self.hash.strip_prefix("sha256=")
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOptions {
  pub uploaded_by: String,
  /// Seconds since the epoch recorded for new entries.
  pub timestamp: u64,
}

impl IndexOptions {
  /// `git@<short hash>` and the commit time of the checkout at `repo`, so
  /// staging the same commit twice records the same identity.
  pub async fn from_git(repo: &Path) -> Result<Self, IndexError> {
    let output = tokio::process::Command::new("git")
      .args(["show", "--no-patch", "--format=%h %ct"])
      .current_dir(repo)
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|e| IndexError::Commit(e.to_string()))?;

    if !output.status.success() {
      return Err(IndexError::Commit(String::from_utf8_lossy(&output.stderr).trim().to_string()));
    }
    parse_commit_info(&String::from_utf8_lossy(&output.stdout))
  }
}

fn parse_commit_info(line: &str) -> Result<IndexOptions, IndexError> {
  let mut parts = line.split_whitespace();
  match (parts.next(), parts.next().and_then(|t| t.parse::<u64>().ok()), parts.next()) {
    (Some(hash), Some(timestamp), None) => Ok(IndexOptions {
      uploaded_by: format!("git@{hash}"),
      timestamp,
    }),
    _ => Err(IndexError::Commit(format!("unexpected `git show` output {line:?}"))),
  }
}

/// Parse a `packages.json` file. Blank lines are ignored.
pub fn read_index(path: &Path) -> Result<Vec<IndexEntry>, IndexError> {
  let text = fs::read_to_string(path).map_err(|source| IndexError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  parse_index(&text)
}

/// The store's current `packages.json`, or `None` when it has none yet.
pub async fn fetch_index<S: ObjectStore>(store: &S) -> Result<Option<Vec<IndexEntry>>, IndexError> {
  match store.get(INDEX_FILE).await? {
    Some(body) => parse_index(&String::from_utf8_lossy(&body)).map(Some),
    None => Ok(None),
  }
}

pub fn parse_index(text: &str) -> Result<Vec<IndexEntry>, IndexError> {
  text
    .lines()
    .enumerate()
    .filter(|(_, line)| !line.trim().is_empty())
    .map(|(i, line)| serde_json::from_str(line).map_err(|source| IndexError::Parse { line: i + 1, source }))
    .collect()
}

/// The normalised project name an artifact file belongs to.
///
/// Wheels are `name-version-tags.whl`; anything else is assumed to be
/// `name-version.<ext>`.
pub fn project_name(filename: &str) -> String {
  let raw = match filename.strip_suffix(".whl") {
    Some(stem) => stem.split('-').next().unwrap_or(stem),
    None => {
      let stem = [".tar.gz", ".tar.xz", ".tar.bz2", ".zip"]
        .iter()
        .find_map(|ext| filename.strip_suffix(ext))
        .unwrap_or(filename);
      stem.rsplit_once('-').map(|(name, _)| name).unwrap_or(stem)
    }
  };
  normalize(raw)
}

/// Index fields from the wheel's top-level `*.dist-info/METADATA`.
pub fn wheel_metadata(wheel: &Path) -> Result<Map<String, Value>, IndexError> {
  let meta_err = |message: String| IndexError::Metadata {
    path: wheel.to_path_buf(),
    message,
  };

  let file = fs::File::open(wheel).map_err(|source| IndexError::Io {
    path: wheel.to_path_buf(),
    source,
  })?;
  let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| meta_err(e.to_string()))?;

  let name = {
    let mut candidates = archive
      .file_names()
      .filter(|name| name.ends_with(".dist-info/METADATA") && name.matches('/').count() == 1);
    match (candidates.next(), candidates.next()) {
      (Some(name), None) => name.to_string(),
      (None, _) => return Err(meta_err("no *.dist-info/METADATA".to_string())),
      (Some(_), Some(_)) => return Err(meta_err("more than one *.dist-info/METADATA".to_string())),
    }
  };

  let mut text = String::new();
  archive
    .by_name(&name)
    .map_err(|e| meta_err(e.to_string()))?
    .read_to_string(&mut text)
    .map_err(|e| meta_err(e.to_string()))?;

  Ok(metadata_fields(&text))
}

fn metadata_fields(text: &str) -> Map<String, Value> {
  let headers = parse_headers(text);

  let mut fields = Map::new();
  let requires_dist: Vec<Value> = header_values(&headers, "Requires-Dist")
    .map(|v| Value::String(v.to_string()))
    .collect();
  if !requires_dist.is_empty() {
    fields.insert("requires_dist".to_string(), Value::Array(requires_dist));
  }
  if let Some(python) = header_values(&headers, "Requires-Python").next() {
    fields.insert("requires_python".to_string(), Value::String(python.to_string()));
  }
  fields
}

fn header_values<'a>(headers: &'a [(String, String)], key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
  headers
    .iter()
    .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
    .map(|(_, v)| v.as_str())
    .filter(|v| !v.is_empty())
}

/// Headers of an RFC 822 style message, up to the first blank line.
/// Continuation lines are folded into the previous value.
fn parse_headers(text: &str) -> Vec<(String, String)> {
  let mut headers: Vec<(String, String)> = Vec::new();
  for line in text.lines() {
    if line.trim().is_empty() {
      break;
    }
    if line.starts_with([' ', '\t']) {
      if let Some((_, value)) = headers.last_mut() {
        value.push(' ');
        value.push_str(line.trim());
      }
      continue;
    }
    if let Some((key, value)) = line.split_once(':') {
      headers.push((key.trim().to_string(), value.trim().to_string()));
    }
  }
  headers
}

/// Lowercase, with each run of `-`, `_` and `.` collapsed to one `-`.
fn normalize(name: &str) -> String {
  let mut out = String::with_capacity(name.len());
  let mut in_separator = false;
  for c in name.chars() {
    if matches!(c, '-' | '_' | '.') {
      if !in_separator {
        out.push('-');
      }
      in_separator = true;
    } else {
      out.extend(c.to_lowercase());
      in_separator = false;
    }
  }
  out
}

/// Stage the artifacts under `dist` into a fresh mirror tree at `dest`.
///
/// Artifacts are taken in sorted path order and de-duplicated by file name,
/// first one wins. An artifact already listed in `previous` is an error:
/// published files are immutable. Wheels must carry readable metadata;
/// other artifacts are indexed without it. `dest` is replaced wholesale.
pub fn collect(
  dist: &Path,
  dest: &Path,
  previous: &[IndexEntry],
  options: &IndexOptions,
) -> Result<PublishManifest, IndexError> {
  let io_err = |path: &Path| {
    let path = path.to_path_buf();
    move |source: std::io::Error| IndexError::Io { path, source }
  };

  let published: HashSet<&str> = previous.iter().map(|e| e.filename.as_str()).collect();

  let mut files = Vec::new();
  for entry in WalkDir::new(dist).sort_by_file_name() {
    let entry = entry.map_err(|e| IndexError::Walk {
      path: dist.to_path_buf(),
      message: e.to_string(),
    })?;
    if entry.file_type().is_file() {
      files.push(entry.into_path());
    }
  }
  files.sort();

  if dest.exists() {
    fs::remove_dir_all(dest).map_err(io_err(dest))?;
  }
  let wheels = dest.join(ARTIFACT_DIR);
  fs::create_dir_all(&wheels).map_err(io_err(&wheels))?;

  let mut seen = HashSet::new();
  let mut added = Vec::new();
  for file in &files {
    let Some(name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
      continue;
    };
    if published.contains(name.as_str()) {
      return Err(IndexError::AlreadyPublished(name));
    }
    if !seen.insert(name.clone()) {
      debug!(file = %file.display(), "duplicate artifact name, keeping first");
      continue;
    }

    let digest = integrity::hash_file(file)?;
    let extra = if name.ends_with(".whl") {
      wheel_metadata(file)?
    } else {
      Map::new()
    };
    let target = wheels.join(&name);
    fs::copy(file, &target).map_err(io_err(file))?;

    added.push(IndexEntry {
      filename: name,
      hash: format!("sha256={digest}"),
      upload_timestamp: options.timestamp,
      uploaded_by: options.uploaded_by.clone(),
      extra,
    });
  }

  let all: Vec<&IndexEntry> = previous.iter().chain(added.iter()).collect();
  let mut manifest = write_pages(dest, &all)?;

  let mut index = String::new();
  for entry in &all {
    let line = serde_json::to_string(entry).map_err(IndexError::Encode)?;
    index.push_str(&line);
    index.push('\n');
  }
  let index_path = dest.join(INDEX_FILE);
  fs::write(&index_path, index).map_err(io_err(&index_path))?;

  manifest.extend(
    added
      .iter()
      .map(|e| ManifestEntry::new(ArtifactClass::ImmutableBinary, format!("{ARTIFACT_DIR}/{}", e.filename))),
  );
  manifest.push(ManifestEntry::new(ArtifactClass::AuthoritativeIndex, INDEX_FILE));

  info!(new = added.len(), total = all.len(), dest = %dest.display(), "staged mirror");
  Ok(PublishManifest::new(manifest))
}

fn write_pages(dest: &Path, entries: &[&IndexEntry]) -> Result<Vec<ManifestEntry>, IndexError> {
  let mut projects: BTreeMap<String, Vec<&IndexEntry>> = BTreeMap::new();
  for &entry in entries {
    projects.entry(project_name(&entry.filename)).or_default().push(entry);
  }

  let mut written = Vec::new();
  let mut write = |rel: String, html: String| -> Result<(), IndexError> {
    let path = rel.split('/').fold(dest.to_path_buf(), |acc, p| acc.join(p));
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|source| IndexError::Io {
        path: parent.to_path_buf(),
        source,
      })?;
    }
    fs::write(&path, html).map_err(|source| IndexError::Io { path, source })?;
    written.push(ManifestEntry::new(ArtifactClass::MutablePage, rel));
    Ok(())
  };

  let mut root = page_header("Simple index");
  for project in projects.keys() {
    root.push_str(&format!("    <a href=\"{project}/\">{project}</a><br/>\n"));
  }
  root.push_str(PAGE_FOOTER);
  write(format!("{PAGES_DIR}/index.html"), root)?;

  for (project, files) in &projects {
    let mut page = page_header(&format!("Links for {project}"));
    let mut files = files.clone();
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    for entry in files {
      let fragment = entry.digest().map(|d| format!("#sha256={d}")).unwrap_or_default();
      page.push_str(&format!(
        "    <a href=\"../../{ARTIFACT_DIR}/{name}{fragment}\">{name}</a><br/>\n",
        name = entry.filename
      ));
    }
    page.push_str(PAGE_FOOTER);
    write(format!("{PAGES_DIR}/{project}/index.html"), page)?;
  }

  Ok(written)
}

const PAGE_FOOTER: &str = "  </body>\n</html>\n";

fn page_header(title: &str) -> String {
  format!("<!DOCTYPE html>\n<html>\n  <head><title>{title}</title></head>\n  <body>\n    <h1>{title}</h1>\n")
}
