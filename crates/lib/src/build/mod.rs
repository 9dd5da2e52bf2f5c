//! Build specs and the build driver.
//!
//! A [`BuildSpec`] describes one pinned dependency; [`driver::run`] executes
//! its steps through a [`Toolchain`].

pub mod driver;
pub mod toolchain;
pub mod types;

use std::time::Duration;

use thiserror::Error;

use crate::placeholder::PlaceholderError;

pub use driver::{ArtifactSet, RunDirs, run};
pub use toolchain::{Invocation, ProcessToolchain, StepStatus, Toolchain};
pub use types::{BuildSpec, PatchSpec, SourceLocator, Step, StepDir, StepKind};

#[derive(Debug, Error)]
pub enum BuildError {
  #[error("step '{step}' ({kind}) failed with {status}")]
  StepFailed {
    step: String,
    kind: StepKind,
    status: StepStatus,
  },

  #[error("step '{step}' timed out after {}", humantime::format_duration(*.after))]
  TimedOut { step: String, after: Duration },

  #[error("step '{step}' could not start '{program}': {source}")]
  Spawn {
    step: String,
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("step '{step}': {source}")]
  Placeholder {
    step: String,
    #[source]
    source: PlaceholderError,
  },

  #[error("failed to list installed files: {0}")]
  Collect(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}
