//! Ordered, fail-fast execution of a spec's toolchain steps.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info};
use walkdir::WalkDir;

use super::BuildError;
use super::toolchain::{Invocation, Toolchain};
use super::types::{BuildSpec, StepDir};
use crate::env::Environment;
use crate::placeholder::{self, PlaceholderError, Resolver};

/// Conventional subdirectories of an installation prefix.
pub const PREFIX_LAYOUT: &[&str] = &["bin", "include", "lib"];

/// Directories a run operates in, also used to resolve step placeholders.
#[derive(Debug, Clone)]
pub struct RunDirs {
  pub workspace: PathBuf,
  pub source: PathBuf,
  pub build: PathBuf,
  pub prefix: PathBuf,
  /// Installation prefixes of plan dependencies, by name.
  pub deps: BTreeMap<String, PathBuf>,
  strings: ResolvedStrings,
}

#[derive(Debug, Clone)]
struct ResolvedStrings {
  workspace: String,
  source: String,
  build: String,
  prefix: String,
  deps: BTreeMap<String, String>,
}

impl RunDirs {
  pub fn new(workspace: PathBuf, source: PathBuf, build: PathBuf, prefix: PathBuf, deps: BTreeMap<String, PathBuf>) -> Self {
    let strings = ResolvedStrings {
      workspace: workspace.display().to_string(),
      source: source.display().to_string(),
      build: build.display().to_string(),
      prefix: prefix.display().to_string(),
      deps: deps.iter().map(|(k, v)| (k.clone(), v.display().to_string())).collect(),
    };

    Self {
      workspace,
      source,
      build,
      prefix,
      deps,
      strings,
    }
  }

  /// Lay out directories for `spec` with its sources at `source`.
  pub fn for_spec(spec: &BuildSpec, workspace: &Path, source: PathBuf, deps: BTreeMap<String, PathBuf>) -> Self {
    let build = match &spec.build_subdir {
      Some(subdir) => source.join(subdir),
      None => source.clone(),
    };
    Self::new(workspace.to_path_buf(), source, build, spec.prefix.clone(), deps)
  }
}

impl Resolver for RunDirs {
  fn resolve_prefix(&self) -> &str {
    &self.strings.prefix
  }

  fn resolve_source(&self) -> &str {
    &self.strings.source
  }

  fn resolve_build(&self) -> &str {
    &self.strings.build
  }

  fn resolve_workspace(&self) -> &str {
    &self.strings.workspace
  }

  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .strings
      .deps
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedDep(name.to_string()))
  }
}

/// The files a run installed into its prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ArtifactSet {
  pub prefix: PathBuf,
  /// Paths relative to `prefix`, sorted.
  pub files: Vec<PathBuf>,
}

impl ArtifactSet {
  /// Collect the files under the conventional prefix directories.
  pub fn collect(prefix: &Path) -> Result<Self, BuildError> {
    let mut files = Vec::new();

    for dir in PREFIX_LAYOUT {
      let root = prefix.join(dir);
      if !root.is_dir() {
        continue;
      }
      for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry.map_err(|e| BuildError::Collect(e.to_string()))?;
        if entry.file_type().is_dir() {
          continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(prefix) {
          files.push(rel.to_path_buf());
        }
      }
    }

    files.sort();
    Ok(Self {
      prefix: prefix.to_path_buf(),
      files,
    })
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

/// Run `spec`'s steps in order against `toolchain`.
///
/// Every step sees exactly `env`. The first step that cannot start, exits
/// non-zero or exceeds its timeout ends the run; later steps are never
/// invoked. Whatever earlier steps already wrote to the prefix stays there.
pub async fn run<T: Toolchain>(
  spec: &BuildSpec,
  env: &Environment,
  dirs: &RunDirs,
  toolchain: &T,
  default_timeout: Option<Duration>,
) -> Result<ArtifactSet, BuildError> {
  tokio::fs::create_dir_all(&dirs.prefix).await?;
  if dirs.build != dirs.source {
    tokio::fs::create_dir_all(&dirs.build).await?;
  }

  let total = spec.steps.len();
  for (index, step) in spec.steps.iter().enumerate() {
    let placeholder_err = |source| BuildError::Placeholder {
      step: step.name.clone(),
      source,
    };

    let program = placeholder::substitute(&step.program, dirs).map_err(placeholder_err)?;
    let args = step
      .args
      .iter()
      .map(|arg| placeholder::substitute(arg, dirs))
      .collect::<Result<Vec<_>, _>>()
      .map_err(placeholder_err)?;

    let cwd = match step.dir {
      StepDir::Source => dirs.source.clone(),
      StepDir::Build => dirs.build.clone(),
    };

    let invocation = Invocation {
      step: step.name.clone(),
      program,
      args,
      cwd,
      env: env.clone(),
    };

    info!(
      dependency = %spec.id(),
      step = %step.name,
      kind = %step.kind,
      progress = %format!("{}/{}", index + 1, total),
      "running step"
    );

    let timeout = step.timeout_secs.map(Duration::from_secs).or(default_timeout);
    let status = match timeout {
      Some(limit) => tokio::time::timeout(limit, toolchain.invoke(&invocation))
        .await
        .map_err(|_| BuildError::TimedOut {
          step: step.name.clone(),
          after: limit,
        })?,
      None => toolchain.invoke(&invocation).await,
    }
    .map_err(|source| BuildError::Spawn {
      step: step.name.clone(),
      program: invocation.program.clone(),
      source,
    })?;

    if !status.success {
      error!(dependency = %spec.id(), step = %step.name, status = %status, "step failed");
      return Err(BuildError::StepFailed {
        step: step.name.clone(),
        kind: step.kind,
        status,
      });
    }
  }

  ArtifactSet::collect(&dirs.prefix)
}

#[cfg(test)]
mod tests {
  use std::io;
  use std::sync::Mutex;

  use super::*;
  use crate::build::toolchain::StepStatus;
  use crate::build::types::{SourceLocator, Step, StepKind};
  use tempfile::TempDir;

  /// Records invocations and fails the one named in `fail_step`.
  #[derive(Default)]
  struct RecordingToolchain {
    calls: Mutex<Vec<Invocation>>,
    fail_step: Option<(String, i32)>,
  }

  impl RecordingToolchain {
    fn failing_at(step: &str, code: i32) -> Self {
      Self {
        calls: Mutex::new(Vec::new()),
        fail_step: Some((step.to_string(), code)),
      }
    }

    fn calls(&self) -> Vec<Invocation> {
      self.calls.lock().unwrap().clone()
    }
  }

  impl Toolchain for RecordingToolchain {
    async fn invoke(&self, invocation: &Invocation) -> io::Result<StepStatus> {
      self.calls.lock().unwrap().push(invocation.clone());
      match &self.fail_step {
        Some((name, code)) if *name == invocation.step => Ok(StepStatus::failed(*code)),
        _ => Ok(StepStatus::ok()),
      }
    }
  }

  struct SlowToolchain;

  impl Toolchain for SlowToolchain {
    async fn invoke(&self, _invocation: &Invocation) -> io::Result<StepStatus> {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(StepStatus::ok())
    }
  }

  fn spec(prefix: &Path) -> BuildSpec {
    BuildSpec {
      name: "xmlsec1".to_string(),
      version: "1.3.6".to_string(),
      source: SourceLocator::Archive {
        url: "https://example.com/xmlsec1-1.3.6.tar.gz".to_string(),
        sha256: "0".repeat(64),
      },
      prefix: prefix.to_path_buf(),
      source_subdir: None,
      build_subdir: Some("_build".to_string()),
      steps: vec![
        Step::new("configure", StepKind::Configure, "$${source}/configure").with_args(["--prefix=$${prefix}"]),
        Step::new("make", StepKind::Compile, "make").in_build_dir(),
        Step::new("check", StepKind::SmokeTest, "$${build}/apps/xmlsec1").with_args(["--version"]),
        Step::new("install", StepKind::Install, "make").with_args(["install"]).in_build_dir(),
      ],
      overlay: Default::default(),
      platforms: Default::default(),
      patches: Vec::new(),
      depends_on: Vec::new(),
    }
  }

  fn dirs(temp: &TempDir, spec: &BuildSpec) -> RunDirs {
    let source = temp.path().join("src");
    std::fs::create_dir_all(&source).unwrap();
    RunDirs::for_spec(spec, temp.path(), source, BTreeMap::new())
  }

  #[tokio::test]
  async fn runs_all_steps_in_order_with_resolved_args() {
    let temp = TempDir::new().unwrap();
    let spec = spec(&temp.path().join("prefix"));
    let dirs = dirs(&temp, &spec);
    let toolchain = RecordingToolchain::default();
    let env: Environment = [("PATH", "/usr/bin")].into_iter().collect();

    run(&spec, &env, &dirs, &toolchain, None).await.unwrap();

    let calls = toolchain.calls();
    let names: Vec<_> = calls.iter().map(|c| c.step.as_str()).collect();
    assert_eq!(names, ["configure", "make", "check", "install"]);

    assert_eq!(calls[0].program, format!("{}/configure", dirs.source.display()));
    assert_eq!(calls[0].args, [format!("--prefix={}", dirs.prefix.display())]);
    assert_eq!(calls[0].cwd, dirs.source);
    assert_eq!(calls[1].cwd, dirs.source.join("_build"));
    assert!(calls.iter().all(|c| c.env == env));
    assert!(dirs.build.is_dir());
    assert!(dirs.prefix.is_dir());
  }

  #[tokio::test]
  async fn failing_step_stops_the_run() {
    let temp = TempDir::new().unwrap();
    let spec = spec(&temp.path().join("prefix"));
    let dirs = dirs(&temp, &spec);
    let toolchain = RecordingToolchain::failing_at("make", 2);

    let err = run(&spec, &Environment::new(), &dirs, &toolchain, None).await.unwrap_err();

    match err {
      BuildError::StepFailed { step, kind, status } => {
        assert_eq!(step, "make");
        assert_eq!(kind, StepKind::Compile);
        assert_eq!(status.code, Some(2));
      }
      other => panic!("unexpected error: {other}"),
    }
    assert_eq!(toolchain.calls().len(), 2);
  }

  #[tokio::test]
  async fn failing_smoke_test_blocks_install() {
    let temp = TempDir::new().unwrap();
    let spec = spec(&temp.path().join("prefix"));
    let dirs = dirs(&temp, &spec);
    let toolchain = RecordingToolchain::failing_at("check", 1);

    let err = run(&spec, &Environment::new(), &dirs, &toolchain, None).await.unwrap_err();

    assert!(matches!(err, BuildError::StepFailed { kind: StepKind::SmokeTest, .. }));
    assert!(toolchain.calls().iter().all(|c| c.step != "install"));
  }

  #[tokio::test(start_paused = true)]
  async fn slow_step_times_out() {
    let temp = TempDir::new().unwrap();
    let spec = spec(&temp.path().join("prefix"));
    let dirs = dirs(&temp, &spec);

    let err = run(&spec, &Environment::new(), &dirs, &SlowToolchain, Some(Duration::from_secs(5)))
      .await
      .unwrap_err();

    assert!(matches!(err, BuildError::TimedOut { ref step, .. } if step == "configure"));
  }

  #[tokio::test]
  async fn unresolved_dependency_placeholder_fails_before_invoking() {
    let temp = TempDir::new().unwrap();
    let mut spec = spec(&temp.path().join("prefix"));
    spec.steps[0].args.push("--with-libxml=$${dep:libxml2}".to_string());
    let dirs = dirs(&temp, &spec);
    let toolchain = RecordingToolchain::default();

    let err = run(&spec, &Environment::new(), &dirs, &toolchain, None).await.unwrap_err();

    assert!(matches!(err, BuildError::Placeholder { .. }));
    assert!(toolchain.calls().is_empty());
  }

  #[test]
  fn artifact_set_lists_prefix_layout_only() {
    let temp = TempDir::new().unwrap();
    let prefix = temp.path();
    for file in ["bin/xmlsec1", "lib/libxmlsec1.so", "lib/pkgconfig/xmlsec1.pc", "include/xmlsec/xmlsec.h", "share/doc/README"] {
      let path = prefix.join(file);
      std::fs::create_dir_all(path.parent().unwrap()).unwrap();
      std::fs::write(path, "x").unwrap();
    }

    let artifacts = ArtifactSet::collect(prefix).unwrap();

    let files: Vec<String> = artifacts.files.iter().map(|p| p.display().to_string()).collect();
    assert_eq!(
      files,
      [
        "bin/xmlsec1",
        "include/xmlsec/xmlsec.h",
        "lib/libxmlsec1.so",
        "lib/pkgconfig/xmlsec1.pc"
      ]
    );
  }
}
