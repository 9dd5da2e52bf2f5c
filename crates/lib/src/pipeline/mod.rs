//! One bootstrap run: gate, fetch, verify, build, patch.
//!
//! [`Pipeline::run`] takes a single [`BuildSpec`] from nothing to a
//! populated installation prefix. All intermediate state lives in a
//! workspace that is gone by the time the run's future completes or is
//! dropped; only the prefix survives.

pub mod plan;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::build::driver::{self, ArtifactSet, RunDirs};
use crate::build::toolchain::Toolchain;
use crate::build::types::BuildSpec;
use crate::build::BuildError;
use crate::env::{Environment, EnvironmentOverlay, compose};
use crate::fetch::{FetchError, Fetcher};
use crate::patch::{self, PatchError};
use crate::platform::{Platform, applicable};
use crate::workspace::with_workspace;

pub use plan::{Plan, PlanError, PlanReport};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum PipelineOutcome {
  Built(ArtifactSet),
  Skipped { reason: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Build(#[from] BuildError),

  #[error(transparent)]
  Patch(#[from] PatchError),

  #[error(transparent)]
  Plan(#[from] PlanError),

  #[error("source directory {} not found in fetched tree", .0.display())]
  MissingSourceDir(PathBuf),

  #[error("workspace error: {0}")]
  Io(#[from] std::io::Error),
}

impl PipelineError {
  /// The pipeline stage the error came from, for user-facing messages.
  pub fn stage(&self) -> &'static str {
    match self {
      PipelineError::Fetch(FetchError::Integrity(_)) => "verify",
      PipelineError::Fetch(_) | PipelineError::MissingSourceDir(_) => "fetch",
      PipelineError::Build(_) => "build",
      PipelineError::Patch(_) => "patch",
      PipelineError::Plan(_) => "plan",
      PipelineError::Io(_) => "workspace",
    }
  }
}

/// Shared, read-only context for pipeline runs.
pub struct Pipeline<T> {
  pub fetcher: Fetcher,
  pub toolchain: T,
  /// The environment every run starts from.
  pub base: Environment,
  /// Parent directory for workspaces; the system temp dir when `None`.
  pub work_root: Option<PathBuf>,
  pub step_timeout: Option<Duration>,
  /// Platform the gate evaluates against; `None` when undetectable.
  pub platform: Option<Platform>,
}

impl<T: Toolchain> Pipeline<T> {
  pub fn new(fetcher: Fetcher, toolchain: T, base: Environment) -> Self {
    Self {
      fetcher,
      toolchain,
      base,
      work_root: None,
      step_timeout: None,
      platform: Platform::current(),
    }
  }

  /// Run `spec` on its own.
  pub async fn run(&self, spec: &BuildSpec) -> Result<PipelineOutcome, PipelineError> {
    self.run_with(spec, &EnvironmentOverlay::new(), &BTreeMap::new()).await
  }

  /// Run `spec` with `seed` applied before the spec's own overlay and
  /// `deps` resolving `$${dep:NAME}` placeholders.
  pub async fn run_with(
    &self,
    spec: &BuildSpec,
    seed: &EnvironmentOverlay,
    deps: &BTreeMap<String, PathBuf>,
  ) -> Result<PipelineOutcome, PipelineError> {
    if !applicable(&spec.platforms, self.platform.as_ref()) {
      let on = self
        .platform
        .map(|p| p.to_string())
        .unwrap_or_else(|| "an unknown platform".to_string());
      let reason = format!("{} is not built on {}", spec.id(), on);
      info!(dependency = %spec.id(), %reason, "skipping");
      return Ok(PipelineOutcome::Skipped { reason });
    }

    info!(dependency = %spec.id(), "starting run");
    with_workspace(self.work_root.as_deref(), |workspace| async move {
      let fetched = self
        .fetcher
        .fetch(&spec.source, &workspace.join("src"), &self.toolchain, &self.base)
        .await?;

      let source = match &spec.source_subdir {
        Some(subdir) => fetched.join(subdir),
        None => fetched,
      };
      if !source.is_dir() {
        return Err(PipelineError::MissingSourceDir(source));
      }

      let overlay = seed.clone().extend(spec.overlay.clone());
      let env = compose(&self.base, &overlay);

      let dirs = RunDirs::for_spec(spec, &workspace, source, deps.clone());
      let artifacts = driver::run(spec, &env, &dirs, &self.toolchain, self.step_timeout).await?;

      for rewrite in &spec.patches {
        let files: Vec<PathBuf> = rewrite.files.iter().map(|f| spec.prefix.join(f)).collect();
        patch::patch(&files, &rewrite.rules)?;
      }

      info!(dependency = %spec.id(), prefix = %artifacts.prefix.display(), files = artifacts.files.len(), "built");
      Ok(PipelineOutcome::Built(artifacts))
    })
    .await
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::io;
  use std::path::Path;
  use std::sync::Mutex;

  use super::*;
  use crate::build::toolchain::{Invocation, StepStatus};
  use crate::build::types::{PatchSpec, SourceLocator, Step, StepKind};
  use crate::fetch::archive::tests::{gzip, tarball};
  use crate::integrity::{IntegrityError, hash_bytes};
  use crate::patch::PatchRule;
  use crate::platform::{Applicability, Arch, Os};
  use tempfile::TempDir;

  /// Records invocations and emulates `install` by writing files into the
  /// prefix named by `--prefix=`.
  #[derive(Default)]
  pub(crate) struct StubToolchain {
    pub(crate) calls: Mutex<Vec<Invocation>>,
  }

  impl Toolchain for StubToolchain {
    async fn invoke(&self, invocation: &Invocation) -> io::Result<StepStatus> {
      self.calls.lock().unwrap().push(invocation.clone());
      if invocation.step == "install" {
        let prefix = invocation
          .args
          .iter()
          .find_map(|a| a.strip_prefix("--prefix="))
          .map(PathBuf::from)
          .ok_or_else(|| io::Error::other("install without --prefix"))?;
        std::fs::create_dir_all(prefix.join("lib/pkgconfig"))?;
        std::fs::write(prefix.join("lib/pkgconfig/stub.pc"), "prefix=/tmp/stage\n")?;
      }
      Ok(StepStatus::ok())
    }
  }

  pub(crate) fn archive_spec(name: &str, url: String, sha256: String, prefix: &Path) -> BuildSpec {
    BuildSpec {
      name: name.to_string(),
      version: "1.0".to_string(),
      source: SourceLocator::Archive { url, sha256 },
      prefix: prefix.to_path_buf(),
      source_subdir: None,
      build_subdir: None,
      steps: vec![
        Step::new("configure", StepKind::Configure, "./configure"),
        Step::new("install", StepKind::Install, "make").with_args(["install", "--prefix=$${prefix}"]),
      ],
      overlay: EnvironmentOverlay::new(),
      platforms: Applicability::any(),
      patches: Vec::new(),
      depends_on: Vec::new(),
    }
  }

  pub(crate) fn pipeline(work_root: &Path) -> Pipeline<StubToolchain> {
    let mut pipeline = Pipeline::new(
      Fetcher::new(Some(Duration::from_secs(30))).unwrap(),
      StubToolchain::default(),
      [("PATH", "/usr/bin")].into_iter().collect(),
    );
    pipeline.work_root = Some(work_root.to_path_buf());
    pipeline.platform = Some(Platform::new(Arch::X86_64, Os::Linux));
    pipeline
  }

  pub(crate) fn sample_archive(top: &str) -> Vec<u8> {
    gzip(&tarball(top, &[("configure", "#!/bin/sh\n", 0o755)]))
  }

  fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
  }

  #[tokio::test]
  async fn wrong_digest_fails_and_leaves_no_workspace() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
      .mock("GET", "/zlib-1.0.tar.gz")
      .with_body(sample_archive("zlib-1.0"))
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    let pipeline = pipeline(&work);
    let spec = archive_spec(
      "zlib",
      format!("{}/zlib-1.0.tar.gz", server.url()),
      "0".repeat(64),
      &temp.path().join("prefix"),
    );

    let err = pipeline.run(&spec).await.unwrap_err();

    assert!(matches!(err, PipelineError::Fetch(FetchError::Integrity(IntegrityError::Mismatch { .. }))));
    assert_eq!(err.stage(), "verify");
    assert!(is_empty_dir(&work));
    assert!(pipeline.toolchain.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn inapplicable_platform_skips_without_network() {
    let mut server = mockito::Server::new_async().await;
    let mock = server.mock("GET", "/xmlsec1-1.0.tar.gz").expect(0).create_async().await;

    let temp = TempDir::new().unwrap();
    let pipeline = pipeline(&temp.path().join("work"));
    let mut spec = archive_spec(
      "xmlsec1",
      format!("{}/xmlsec1-1.0.tar.gz", server.url()),
      "0".repeat(64),
      &temp.path().join("prefix"),
    );
    spec.platforms = Applicability::only_os([Os::MacOs]);

    let outcome = pipeline.run(&spec).await.unwrap();

    match outcome {
      PipelineOutcome::Skipped { reason } => assert!(reason.contains("xmlsec1==1.0"), "{reason}"),
      other => panic!("expected skip, got {other:?}"),
    }
    mock.assert_async().await;
    assert!(!temp.path().join("work").exists());
  }

  #[tokio::test]
  async fn builds_and_patches_into_prefix() {
    let body = sample_archive("libxslt-1.0");
    let digest = hash_bytes(&body).0;
    let mut server = mockito::Server::new_async().await;
    let _mock = server
      .mock("GET", "/libxslt-1.0.tar.gz")
      .with_body(body)
      .create_async()
      .await;

    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    let prefix = temp.path().join("prefix");
    let pipeline = pipeline(&work);
    let mut spec = archive_spec("libxslt", format!("{}/libxslt-1.0.tar.gz", server.url()), digest, &prefix);
    spec.overlay = EnvironmentOverlay::new().replace("CFLAGS", "-O2");
    spec.patches = vec![PatchSpec {
      files: vec![PathBuf::from("lib/pkgconfig/stub.pc")],
      rules: vec![PatchRule::new(r"/tmp/stage", "/opt/final")],
    }];

    let outcome = pipeline.run(&spec).await.unwrap();

    let PipelineOutcome::Built(artifacts) = outcome else {
      panic!("expected a build");
    };
    assert_eq!(artifacts.files, [PathBuf::from("lib/pkgconfig/stub.pc")]);
    assert_eq!(
      std::fs::read_to_string(prefix.join("lib/pkgconfig/stub.pc")).unwrap(),
      "prefix=/opt/final\n"
    );

    let calls = pipeline.toolchain.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].env.get("CFLAGS"), Some("-O2"));
    assert_eq!(calls[0].env.get("PATH"), Some("/usr/bin"));
    assert!(calls[0].cwd.ends_with("src"));
    assert!(is_empty_dir(&work));
  }

  #[tokio::test]
  async fn missing_source_subdir_is_reported() {
    let body = sample_archive("pkg-1.0");
    let digest = hash_bytes(&body).0;
    let mut server = mockito::Server::new_async().await;
    let _mock = server.mock("GET", "/pkg-1.0.tar.gz").with_body(body).create_async().await;

    let temp = TempDir::new().unwrap();
    let pipeline = pipeline(&temp.path().join("work"));
    let mut spec = archive_spec("pkg", format!("{}/pkg-1.0.tar.gz", server.url()), digest, &temp.path().join("p"));
    spec.source_subdir = Some("unix".to_string());

    let err = pipeline.run(&spec).await.unwrap_err();
    assert!(matches!(err, PipelineError::MissingSourceDir(_)));
    assert_eq!(err.stage(), "fetch");
  }
}
