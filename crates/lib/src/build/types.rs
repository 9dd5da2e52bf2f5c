use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::env::EnvironmentOverlay;
use crate::patch::PatchRule;
use crate::platform::Applicability;

/// Everything needed for one bootstrap run of one pinned dependency.
///
/// Specs are plain data produced by an external resolver; nothing in the
/// pipeline mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
  pub name: String,
  pub version: String,
  pub source: SourceLocator,
  pub prefix: PathBuf,

  /// Directory inside the fetched tree that holds the sources.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_subdir: Option<String>,

  /// Out-of-tree build directory, relative to the source root.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_subdir: Option<String>,

  pub steps: Vec<Step>,

  #[serde(default, skip_serializing_if = "EnvironmentOverlay::is_empty")]
  pub overlay: EnvironmentOverlay,

  #[serde(default)]
  pub platforms: Applicability,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub patches: Vec<PatchSpec>,

  /// Plan members whose prefixes must be visible to this build.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub depends_on: Vec<String>,
}

impl BuildSpec {
  /// `name==version`, used in logs and error messages.
  pub fn id(&self) -> String {
    format!("{}=={}", self.name, self.version)
  }
}

/// Where the sources come from and how they are pinned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceLocator {
  /// A release archive pinned by content digest.
  Archive { url: String, sha256: String },
  /// A repository pinned by exact commit or tag.
  Revision {
    url: String,
    rev: String,
    #[serde(default)]
    submodules: bool,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
  Configure,
  Compile,
  SmokeTest,
  Install,
}

impl std::fmt::Display for StepKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      StepKind::Configure => "configure",
      StepKind::Compile => "compile",
      StepKind::SmokeTest => "smoke-test",
      StepKind::Install => "install",
    };
    f.write_str(s)
  }
}

/// Working directory a step runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepDir {
  #[default]
  Source,
  Build,
}

/// One external toolchain invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
  pub name: String,
  pub kind: StepKind,
  pub program: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub dir: StepDir,
  /// Overrides the configured per-step timeout.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_secs: Option<u64>,
}

impl Step {
  pub fn new(name: &str, kind: StepKind, program: &str) -> Self {
    Self {
      name: name.to_string(),
      kind,
      program: program.to_string(),
      args: Vec::new(),
      dir: StepDir::Source,
      timeout_secs: None,
    }
  }

  pub fn with_args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args = args.into_iter().map(Into::into).collect();
    self
  }

  pub fn in_build_dir(mut self) -> Self {
    self.dir = StepDir::Build;
    self
  }
}

/// Post-install rewrites for generated metadata inside the prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSpec {
  /// Files relative to the installation prefix.
  pub files: Vec<PathBuf>,
  pub rules: Vec<PatchRule>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn spec_deserializes_with_defaults() {
    let spec: BuildSpec = serde_json::from_str(
      r#"{
        "name": "libxml2",
        "version": "2.13.5",
        "source": {
          "type": "archive",
          "url": "https://download.gnome.org/sources/libxml2/2.13/libxml2-2.13.5.tar.xz",
          "sha256": "74fc163217a3964257d3be39af943e08861263c4231f9ef5b496b6f6d4c7b2b6"
        },
        "prefix": "/opt/prefix/libxml2",
        "steps": [
          {"name": "configure", "kind": "configure", "program": "./configure", "args": ["--prefix=$${prefix}"]},
          {"name": "make", "kind": "compile", "program": "make"},
          {"name": "install", "kind": "install", "program": "make", "args": ["install"]}
        ]
      }"#,
    )
    .unwrap();

    assert_eq!(spec.id(), "libxml2==2.13.5");
    assert!(matches!(spec.source, SourceLocator::Archive { .. }));
    assert_eq!(spec.steps.len(), 3);
    assert_eq!(spec.steps[0].dir, StepDir::Source);
    assert!(spec.overlay.is_empty());
    assert!(spec.platforms.is_unconstrained());
    assert!(spec.depends_on.is_empty());
  }

  #[test]
  fn revision_source_defaults_to_no_submodules() {
    let source: SourceLocator =
      serde_json::from_str(r#"{"type": "revision", "url": "https://example.com/x.git", "rev": "v1.2.3"}"#).unwrap();
    assert_eq!(
      source,
      SourceLocator::Revision {
        url: "https://example.com/x.git".to_string(),
        rev: "v1.2.3".to_string(),
        submodules: false,
      }
    );
  }

  #[test]
  fn step_kind_display() {
    assert_eq!(StepKind::SmokeTest.to_string(), "smoke-test");
  }
}
