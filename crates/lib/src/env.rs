//! Environment composition for build steps.
//!
//! A run never touches the process environment. Instead it captures an
//! [`Environment`] value once, derives a new value from it by applying an
//! [`EnvironmentOverlay`], and hands that value to every child process it
//! spawns. Two runs in the same process therefore never observe each other's
//! variables.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Compiler and linker hint variables removed by
/// [`EnvironmentOverlay::strip_compiler_hints`].
pub const COMPILER_HINT_VARS: &[&str] = &["CFLAGS", "CPPFLAGS", "CXXFLAGS", "LDFLAGS", "ARCHFLAGS"];

/// An owned set of environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot the current process environment.
  ///
  /// Variables that are not valid unicode are skipped.
  pub fn from_process() -> Self {
    Self(std::env::vars_os().filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))).collect())
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(name).map(String::as_str)
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.0.insert(name.into(), value.into());
  }

  pub fn remove(&mut self, name: &str) -> Option<String> {
    self.0.remove(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }
}

/// How prepended components are joined to an existing value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Separator {
  /// The platform search-path separator (`:` or `;`).
  PathList,
  /// A single space, for flag strings like `CPPFLAGS`.
  Space,
}

impl Separator {
  pub fn as_str(&self) -> &'static str {
    match self {
      #[cfg(windows)]
      Self::PathList => ";",
      #[cfg(not(windows))]
      Self::PathList => ":",
      Self::Space => " ",
    }
  }
}

/// A composition rule for a single variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum Rule {
  /// Put `value` in front of whatever the variable currently holds.
  Prepend { value: String, separator: Separator },
  /// Set the variable to `value` regardless of its current value.
  Replace { value: String },
  /// Remove the variable.
  Unset,
  /// Keep the inherited value.
  Inherit,
}

/// An ordered list of variable rules applied on top of an inherited
/// environment.
///
/// Rules for different variables commute. Rules for the same variable apply
/// in list order, so two prepends `A` then `B` yield `B:A:<inherited>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentOverlay {
  rules: Vec<(String, Rule)>,
}

impl EnvironmentOverlay {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn prepend(mut self, name: &str, value: impl Into<String>, separator: Separator) -> Self {
    self.rules.push((
      name.to_string(),
      Rule::Prepend {
        value: value.into(),
        separator,
      },
    ));
    self
  }

  pub fn replace(mut self, name: &str, value: impl Into<String>) -> Self {
    self
      .rules
      .push((name.to_string(), Rule::Replace { value: value.into() }));
    self
  }

  pub fn unset(mut self, name: &str) -> Self {
    self.rules.push((name.to_string(), Rule::Unset));
    self
  }

  pub fn inherit(mut self, name: &str) -> Self {
    self.rules.push((name.to_string(), Rule::Inherit));
    self
  }

  /// Rules that make an installation prefix visible to a later build: its
  /// binaries, headers, libraries and pkg-config files.
  pub fn for_prefix(prefix: &Path) -> Self {
    let bin = prefix.join("bin");
    let include = prefix.join("include");
    let lib = prefix.join("lib");
    let pkgconfig = lib.join("pkgconfig");

    Self::new()
      .prepend("PATH", bin.display().to_string(), Separator::PathList)
      .prepend("CPPFLAGS", format!("-I{}", include.display()), Separator::Space)
      .prepend("LDFLAGS", format!("-L{}", lib.display()), Separator::Space)
      .prepend("LD_LIBRARY_PATH", lib.display().to_string(), Separator::PathList)
      .prepend("PKG_CONFIG_PATH", pkgconfig.display().to_string(), Separator::PathList)
  }

  /// Rules that drop inherited compiler and linker hints so a build sees
  /// only what its own overlay provides.
  pub fn strip_compiler_hints() -> Self {
    COMPILER_HINT_VARS.iter().fold(Self::new(), |overlay, name| overlay.unset(name))
  }

  /// Append `other`'s rules after this overlay's rules.
  pub fn extend(mut self, other: EnvironmentOverlay) -> Self {
    self.rules.extend(other.rules);
    self
  }

  pub fn rules(&self) -> &[(String, Rule)] {
    &self.rules
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }
}

/// Derive a new environment by applying `overlay` to `base`.
///
/// `base` is left untouched.
pub fn compose(base: &Environment, overlay: &EnvironmentOverlay) -> Environment {
  let mut env = base.clone();

  for (name, rule) in &overlay.rules {
    match rule {
      Rule::Prepend { value, separator } => {
        let joined = match env.get(name) {
          Some(existing) if !existing.is_empty() => format!("{}{}{}", value, separator.as_str(), existing),
          _ => value.clone(),
        };
        env.set(name.as_str(), joined);
      }
      Rule::Replace { value } => env.set(name.as_str(), value.as_str()),
      Rule::Unset => {
        env.remove(name);
      }
      Rule::Inherit => {}
    }
  }

  env
}
