//! Object stores the publisher writes to.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE};
use thiserror::Error;
use tracing::debug;

use super::CacheDirective;

/// Suffix of the file a [`LocalStore`] writes next to each object to record
/// its cache directive.
pub const CACHE_CONTROL_SUFFIX: &str = ".cache-control";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("{path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{path}: {message}")]
  Http { path: String, message: String },

  #[error("unsupported store URL: {0}")]
  InvalidUrl(String),
}

/// A flat key/value store addressed by slash-separated paths.
pub trait ObjectStore: Send + Sync {
  fn exists(&self, path: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

  /// The object's content, or `None` when absent.
  fn get(&self, path: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

  fn put(&self, path: &str, body: Vec<u8>, cache: CacheDirective) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// A directory mirror, e.g. a checkout served by a static web server.
#[derive(Debug, Clone)]
pub struct LocalStore {
  root: PathBuf,
}

impl LocalStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn resolve(&self, path: &str) -> PathBuf {
    path.split('/').fold(self.root.clone(), |acc, part| acc.join(part))
  }
}

impl ObjectStore for LocalStore {
  async fn exists(&self, path: &str) -> Result<bool, StoreError> {
    tokio::fs::try_exists(self.resolve(path))
      .await
      .map_err(|source| StoreError::Io {
        path: path.to_string(),
        source,
      })
  }

  async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(self.resolve(path)).await {
      Ok(body) => Ok(Some(body)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(source) => Err(StoreError::Io {
        path: path.to_string(),
        source,
      }),
    }
  }

  /// Both the sidecar and the object are replaced by rename, so readers see
  /// either the old or the new content, never a partial write.
  async fn put(&self, path: &str, body: Vec<u8>, cache: CacheDirective) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
      path: path.to_string(),
      source,
    };

    let target = self.resolve(path);
    let mut sidecar = target.clone().into_os_string();
    sidecar.push(CACHE_CONTROL_SUFFIX);
    let sidecar = PathBuf::from(sidecar);

    let written = target.clone();
    tokio::task::spawn_blocking(move || {
      write_atomic(&sidecar, cache.header_value().as_bytes())?;
      write_atomic(&written, &body)
    })
    .await
    .map_err(|e| io_err(io::Error::other(e)))?
    .map_err(io_err)?;

    debug!(path = %path, target = %target.display(), "stored object");
    Ok(())
  }
}

/// Write `body` to a temporary file next to `target`, then rename it over
/// `target`.
fn write_atomic(target: &Path, body: &[u8]) -> io::Result<()> {
  let parent = target
    .parent()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "object path has no parent"))?;
  std::fs::create_dir_all(parent)?;

  let mut file = tempfile::NamedTempFile::new_in(parent)?;
  file.write_all(body)?;
  file.as_file().sync_all()?;
  file.persist(target).map_err(|e| e.error)?;
  Ok(())
}

/// A store that accepts `HEAD` and `PUT` under a base URL.
#[derive(Debug, Clone)]
pub struct HttpStore {
  base: String,
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpStore {
  pub fn new(base: &str, client: reqwest::Client, token: Option<String>) -> Self {
    let base = if base.ends_with('/') {
      base.to_string()
    } else {
      format!("{base}/")
    };
    Self { base, client, token }
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base, path)
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }
}

fn content_type(path: &str) -> &'static str {
  if path.ends_with(".html") {
    "text/html; charset=utf-8"
  } else if path.ends_with(".json") {
    "application/json"
  } else {
    "application/octet-stream"
  }
}

impl ObjectStore for HttpStore {
  async fn exists(&self, path: &str) -> Result<bool, StoreError> {
    let http_err = |message: String| StoreError::Http {
      path: path.to_string(),
      message,
    };

    let response = self
      .authorize(self.client.head(self.url(path)))
      .send()
      .await
      .map_err(|e| http_err(e.to_string()))?;

    match response.status() {
      status if status.is_success() => Ok(true),
      StatusCode::NOT_FOUND => Ok(false),
      status => Err(http_err(format!("HEAD returned {status}"))),
    }
  }

  async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let http_err = |message: String| StoreError::Http {
      path: path.to_string(),
      message,
    };

    let response = self
      .authorize(self.client.get(self.url(path)))
      .send()
      .await
      .map_err(|e| http_err(e.to_string()))?;

    match response.status() {
      StatusCode::NOT_FOUND => Ok(None),
      status if status.is_success() => {
        let body = response.bytes().await.map_err(|e| http_err(e.to_string()))?;
        Ok(Some(body.to_vec()))
      }
      status => Err(http_err(format!("GET returned {status}"))),
    }
  }

  async fn put(&self, path: &str, body: Vec<u8>, cache: CacheDirective) -> Result<(), StoreError> {
    let http_err = |message: String| StoreError::Http {
      path: path.to_string(),
      message,
    };

    let response = self
      .authorize(self.client.put(self.url(path)))
      .header(CACHE_CONTROL, cache.header_value())
      .header(CONTENT_TYPE, content_type(path))
      .body(body)
      .send()
      .await
      .map_err(|e| http_err(e.to_string()))?;

    if !response.status().is_success() {
      return Err(http_err(format!("PUT returned {}", response.status())));
    }

    debug!(path = %path, "uploaded object");
    Ok(())
  }
}

/// A store selected from a URL at runtime.
#[derive(Debug, Clone)]
pub enum Store {
  Local(LocalStore),
  Http(HttpStore),
}

impl Store {
  /// `http://` and `https://` URLs select an [`HttpStore`]; `file://` URLs
  /// and bare paths select a [`LocalStore`].
  pub fn open(url: &str, client: reqwest::Client, token: Option<String>) -> Result<Self, StoreError> {
    if url.starts_with("http://") || url.starts_with("https://") {
      return Ok(Store::Http(HttpStore::new(url, client, token)));
    }

    if url.contains("://") && !url.starts_with("file://") {
      return Err(StoreError::InvalidUrl(url.to_string()));
    }

    let path = url.strip_prefix("file://").unwrap_or(url);
    if path.is_empty() {
      return Err(StoreError::InvalidUrl(url.to_string()));
    }
    Ok(Store::Local(LocalStore::new(path)))
  }

  /// [`Store::open`] with a fresh HTTP client bounded by `timeout`.
  pub fn connect(url: &str, timeout: Duration, token: Option<String>) -> Result<Self, StoreError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| StoreError::Http {
        path: url.to_string(),
        message: e.to_string(),
      })?;
    Self::open(url, client, token)
  }
}

impl ObjectStore for Store {
  async fn exists(&self, path: &str) -> Result<bool, StoreError> {
    match self {
      Store::Local(store) => store.exists(path).await,
      Store::Http(store) => store.exists(path).await,
    }
  }

  async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
    match self {
      Store::Local(store) => store.get(path).await,
      Store::Http(store) => store.get(path).await,
    }
  }

  async fn put(&self, path: &str, body: Vec<u8>, cache: CacheDirective) -> Result<(), StoreError> {
    match self {
      Store::Local(store) => store.put(path, body, cache).await,
      Store::Http(store) => store.put(path, body, cache).await,
    }
  }
}
