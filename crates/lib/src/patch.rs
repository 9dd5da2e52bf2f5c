//! Post-install rewrites of generated build metadata.
//!
//! Some installs bake the toolchain that built them into generated files
//! (sysconfig data, `*-config` scripts, pkg-config files). Those references
//! are rewritten here. Every rule must change the file it is applied to: a
//! rule that matches nothing means the upstream output format moved, and the
//! run fails rather than shipping an unpatched artifact.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// A regex substitution. `replacement` may use `$1`-style group references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRule {
  pub pattern: String,
  pub replacement: String,
}

impl PatchRule {
  pub fn new(pattern: &str, replacement: &str) -> Self {
    Self {
      pattern: pattern.to_string(),
      replacement: replacement.to_string(),
    }
  }
}

#[derive(Debug, Error)]
pub enum PatchError {
  #[error("pattern {pattern:?} did not change {}; generated metadata format may have drifted", .file.display())]
  PatternNotFound { file: PathBuf, pattern: String },

  #[error("invalid pattern {pattern:?}: {source}")]
  InvalidPattern {
    pattern: String,
    #[source]
    source: regex::Error,
  },

  #[error("failed to access {}: {source}", .file.display())]
  Io {
    file: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Apply every rule to every file, in place.
///
/// All patterns are compiled before any file is touched. A file is written
/// only after every rule has changed it, so a failing file is left
/// byte-identical.
pub fn patch(files: &[PathBuf], rules: &[PatchRule]) -> Result<(), PatchError> {
  let compiled = rules
    .iter()
    .map(|rule| {
      Regex::new(&rule.pattern)
        .map(|re| (re, rule))
        .map_err(|source| PatchError::InvalidPattern {
          pattern: rule.pattern.clone(),
          source,
        })
    })
    .collect::<Result<Vec<_>, _>>()?;

  for file in files {
    patch_file(file, &compiled)?;
  }

  Ok(())
}

fn patch_file(file: &Path, rules: &[(Regex, &PatchRule)]) -> Result<(), PatchError> {
  let io_err = |source| PatchError::Io {
    file: file.to_path_buf(),
    source,
  };

  let original = std::fs::read_to_string(file).map_err(io_err)?;
  let mut content = original.clone();

  for (re, rule) in rules {
    let replaced = re.replace_all(&content, rule.replacement.as_str()).into_owned();
    if replaced == content {
      return Err(PatchError::PatternNotFound {
        file: file.to_path_buf(),
        pattern: rule.pattern.clone(),
      });
    }
    debug!(file = %file.display(), pattern = %rule.pattern, "pattern applied");
    content = replaced;
  }

  std::fs::write(file, content).map_err(io_err)?;
  info!(file = %file.display(), rules = rules.len(), "patched metadata");
  Ok(())
}
