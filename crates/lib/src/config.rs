//! Runtime configuration.
//!
//! Values come from command-line flags, then `NATIVEBOOT_*` environment
//! variables, then built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::consts::{DEFAULT_FETCH_TIMEOUT_SECS, DEFAULT_STEP_TIMEOUT_SECS, DEFAULT_UPLOAD_JOBS};

pub const WORK_DIR_VAR: &str = "NATIVEBOOT_WORK_DIR";
pub const FETCH_TIMEOUT_VAR: &str = "NATIVEBOOT_FETCH_TIMEOUT";
pub const STEP_TIMEOUT_VAR: &str = "NATIVEBOOT_STEP_TIMEOUT";
pub const UPLOAD_JOBS_VAR: &str = "NATIVEBOOT_UPLOAD_JOBS";
pub const STORE_TOKEN_VAR: &str = "NATIVEBOOT_STORE_TOKEN";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("{var}={value:?} is not a duration: {source}")]
  InvalidDuration {
    var: &'static str,
    value: String,
    #[source]
    source: humantime::DurationError,
  },

  #[error("{var}={value:?} is not a positive integer")]
  InvalidNumber { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
  /// Parent directory for run workspaces. System temp dir when unset.
  pub work_dir: Option<PathBuf>,
  pub fetch_timeout: Duration,
  /// Default per-step limit for steps without their own timeout.
  pub step_timeout: Duration,
  pub upload_jobs: usize,
  pub store_token: Option<String>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      work_dir: None,
      fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
      step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
      upload_jobs: DEFAULT_UPLOAD_JOBS,
      store_token: None,
    }
  }
}

/// Values given on the command line. `None` falls through to the
/// environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
  pub work_dir: Option<PathBuf>,
  pub fetch_timeout: Option<Duration>,
  pub step_timeout: Option<Duration>,
  pub upload_jobs: Option<usize>,
}

impl Config {
  /// Resolve configuration from `overrides`, the process environment and
  /// defaults.
  pub fn resolve(overrides: Overrides) -> Result<Self, ConfigError> {
    let defaults = Self::default();

    let work_dir = match overrides.work_dir {
      Some(dir) => Some(dir),
      None => var(WORK_DIR_VAR).map(PathBuf::from),
    };

    let fetch_timeout = match overrides.fetch_timeout {
      Some(limit) => limit,
      None => duration_var(FETCH_TIMEOUT_VAR)?.unwrap_or(defaults.fetch_timeout),
    };

    let step_timeout = match overrides.step_timeout {
      Some(limit) => limit,
      None => duration_var(STEP_TIMEOUT_VAR)?.unwrap_or(defaults.step_timeout),
    };

    let upload_jobs = match overrides.upload_jobs {
      Some(jobs) => jobs,
      None => jobs_var(UPLOAD_JOBS_VAR)?.unwrap_or(defaults.upload_jobs),
    };

    Ok(Self {
      work_dir,
      fetch_timeout,
      step_timeout,
      upload_jobs,
      store_token: var(STORE_TOKEN_VAR),
    })
  }
}

/// A set, non-empty environment variable.
fn var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn duration_var(name: &'static str) -> Result<Option<Duration>, ConfigError> {
  var(name)
    .map(|value| {
      humantime::parse_duration(&value).map_err(|source| ConfigError::InvalidDuration { var: name, value, source })
    })
    .transpose()
}

fn jobs_var(name: &'static str) -> Result<Option<usize>, ConfigError> {
  var(name)
    .map(|value| match value.parse::<usize>() {
      Ok(jobs) if jobs > 0 => Ok(jobs),
      _ => Err(ConfigError::InvalidNumber { var: name, value }),
    })
    .transpose()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;
  use temp_env::{with_vars, with_vars_unset};

  const ALL_VARS: [&str; 5] = [WORK_DIR_VAR, FETCH_TIMEOUT_VAR, STEP_TIMEOUT_VAR, UPLOAD_JOBS_VAR, STORE_TOKEN_VAR];

  #[test]
  #[serial]
  fn defaults_apply_without_flags_or_env() {
    with_vars_unset(ALL_VARS, || {
      assert_eq!(Config::resolve(Overrides::default()).unwrap(), Config::default());
    });
  }

  #[test]
  #[serial]
  fn environment_overrides_defaults() {
    with_vars(
      [
        (WORK_DIR_VAR, Some("/var/tmp/nb")),
        (FETCH_TIMEOUT_VAR, Some("90s")),
        (STEP_TIMEOUT_VAR, Some("2h")),
        (UPLOAD_JOBS_VAR, Some("3")),
        (STORE_TOKEN_VAR, Some("tok")),
      ],
      || {
        let config = Config::resolve(Overrides::default()).unwrap();
        assert_eq!(config.work_dir, Some(PathBuf::from("/var/tmp/nb")));
        assert_eq!(config.fetch_timeout, Duration::from_secs(90));
        assert_eq!(config.step_timeout, Duration::from_secs(7200));
        assert_eq!(config.upload_jobs, 3);
        assert_eq!(config.store_token.as_deref(), Some("tok"));
      },
    );
  }

  #[test]
  #[serial]
  fn flags_override_environment() {
    with_vars([(FETCH_TIMEOUT_VAR, Some("90s")), (WORK_DIR_VAR, Some("/env"))], || {
      let config = Config::resolve(Overrides {
        work_dir: Some(PathBuf::from("/flag")),
        fetch_timeout: Some(Duration::from_secs(5)),
        ..Default::default()
      })
      .unwrap();
      assert_eq!(config.work_dir, Some(PathBuf::from("/flag")));
      assert_eq!(config.fetch_timeout, Duration::from_secs(5));
    });
  }

  #[test]
  #[serial]
  fn invalid_values_are_errors() {
    with_vars([(STEP_TIMEOUT_VAR, Some("soon"))], || {
      assert!(matches!(
        Config::resolve(Overrides::default()),
        Err(ConfigError::InvalidDuration { var: STEP_TIMEOUT_VAR, .. })
      ));
    });
    with_vars([(UPLOAD_JOBS_VAR, Some("0"))], || {
      assert!(matches!(
        Config::resolve(Overrides::default()),
        Err(ConfigError::InvalidNumber { .. })
      ));
    });
  }
}
