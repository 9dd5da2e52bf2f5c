//! Release archive download and extraction.
//!
//! The whole response body is buffered, checked against the pinned digest,
//! and only then unpacked. Nothing touches the destination directory before
//! the digest matches.

use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, info};
use xz2::read::XzDecoder;

use super::FetchError;
use crate::integrity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
  TarGz,
  TarXz,
  Tar,
}

impl ArchiveFormat {
  /// Detect the container format from the URL's file name.
  pub fn from_url(url: &str) -> Option<Self> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
      Some(Self::TarGz)
    } else if path.ends_with(".tar.xz") || path.ends_with(".txz") {
      Some(Self::TarXz)
    } else if path.ends_with(".tar") {
      Some(Self::Tar)
    } else {
      None
    }
  }
}

/// Download `url` into memory, failing on transport errors and non-2xx
/// responses.
pub async fn download(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, FetchError> {
  info!(url = %url, "fetching archive");

  let http_err = |message: String| FetchError::Http {
    url: url.to_string(),
    message,
  };

  let response = client.get(url).send().await.map_err(|e| http_err(e.to_string()))?;

  if !response.status().is_success() {
    return Err(http_err(format!("HTTP {}", response.status())));
  }

  let bytes = response.bytes().await.map_err(|e| http_err(e.to_string()))?;
  debug!(url = %url, size = bytes.len(), "download complete");
  Ok(bytes.to_vec())
}

/// Fetch, verify and unpack the archive at `url` into `dest`.
///
/// Returns `dest`, which then holds the archive's contents with the single
/// top-level directory stripped.
pub async fn fetch_archive(client: &reqwest::Client, url: &str, sha256: &str, dest: &Path) -> Result<PathBuf, FetchError> {
  let format = ArchiveFormat::from_url(url).ok_or_else(|| FetchError::UnsupportedArchive(url.to_string()))?;

  let bytes = download(client, url).await?;
  integrity::verify(&bytes, sha256)?;
  debug!(url = %url, "digest verified");

  let dest = dest.to_path_buf();
  let unpack_dest = dest.clone();
  tokio::task::spawn_blocking(move || unpack(&bytes, format, &unpack_dest))
    .await
    .map_err(|e| FetchError::Unpack(std::io::Error::other(e)))??;

  info!(url = %url, dest = %dest.display(), "unpacked archive");
  Ok(dest)
}

/// Unpack verified archive bytes into `dest`, stripping the first path
/// component of every entry.
///
/// Nothing is written through a symlink, and symlink entries must resolve
/// inside `dest` relative to their own directory.
pub fn unpack(bytes: &[u8], format: ArchiveFormat, dest: &Path) -> Result<(), FetchError> {
  let reader: Box<dyn Read> = match format {
    ArchiveFormat::TarGz => Box::new(GzDecoder::new(Cursor::new(bytes))),
    ArchiveFormat::TarXz => Box::new(XzDecoder::new(Cursor::new(bytes))),
    ArchiveFormat::Tar => Box::new(Cursor::new(bytes)),
  };

  fs::create_dir_all(dest).map_err(FetchError::Unpack)?;
  let mut archive = Archive::new(reader);

  for entry in archive.entries().map_err(FetchError::Unpack)? {
    let mut entry = entry.map_err(FetchError::Unpack)?;
    let path = entry.path().map_err(FetchError::Unpack)?.into_owned();

    let Some(stripped) = strip_top_level(&path)? else {
      continue;
    };
    reject_symlinked_path(dest, &stripped, &path)?;
    let dest_path = dest.join(&stripped);

    if let Some(parent) = dest_path.parent() {
      fs::create_dir_all(parent).map_err(FetchError::Unpack)?;
    }

    match entry.header().entry_type() {
      EntryType::Link => {
        // Hard link targets are archive paths and need the same stripping.
        let target = link_target(&entry, &path)?;
        let target = strip_top_level(&target)?.ok_or_else(|| unsafe_entry(&target))?;
        reject_symlinked_path(dest, &target, &path)?;
        fs::hard_link(dest.join(target), &dest_path).map_err(FetchError::Unpack)?;
        continue;
      }
      EntryType::Symlink => {
        let target = link_target(&entry, &path)?;
        if !link_stays_inside(&stripped, &target) {
          return Err(unsafe_entry(&path));
        }
      }
      _ => {}
    }

    entry.unpack(&dest_path).map_err(FetchError::Unpack)?;
  }

  Ok(())
}

fn unsafe_entry(path: &Path) -> FetchError {
  FetchError::UnsafeEntry(path.display().to_string())
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>, path: &Path) -> Result<PathBuf, FetchError> {
  entry
    .link_name()
    .map_err(FetchError::Unpack)?
    .map(|target| target.into_owned())
    .ok_or_else(|| unsafe_entry(path))
}

/// Drop the first component of an archive path, rejecting anything that
/// could land outside the destination.
fn strip_top_level(path: &Path) -> Result<Option<PathBuf>, FetchError> {
  let mut stripped = PathBuf::new();
  for component in path.components().skip(1) {
    match component {
      Component::Normal(part) => stripped.push(part),
      Component::CurDir => {}
      _ => return Err(unsafe_entry(path)),
    }
  }

  if path.components().next().is_some_and(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
    return Err(unsafe_entry(path));
  }

  Ok((!stripped.as_os_str().is_empty()).then_some(stripped))
}

/// Fail when `relative`, or any of its ancestors below `dest`, already exists
/// as a symlink.
fn reject_symlinked_path(dest: &Path, relative: &Path, entry: &Path) -> Result<(), FetchError> {
  let mut current = dest.to_path_buf();
  for component in relative.components() {
    current.push(component);
    match fs::symlink_metadata(&current) {
      Ok(meta) if meta.file_type().is_symlink() => return Err(unsafe_entry(entry)),
      Ok(_) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
      Err(e) => return Err(FetchError::Unpack(e)),
    }
  }
  Ok(())
}

/// A symlink target must be relative, with every `..` leading and never
/// climbing above the destination root from the link's directory.
fn link_stays_inside(link: &Path, target: &Path) -> bool {
  let mut depth = link.components().count().saturating_sub(1);
  let mut descended = false;
  for component in target.components() {
    match component {
      Component::Normal(_) => descended = true,
      Component::CurDir => {}
      Component::ParentDir if !descended && depth > 0 => depth -= 1,
      _ => return false,
    }
  }
  true
}
