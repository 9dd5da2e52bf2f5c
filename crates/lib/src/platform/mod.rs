//! Platform detection and the applicability gate.
//!
//! A dependency declares the platforms it is needed on. The gate is consulted
//! before any network or filesystem work so inapplicable runs end in a
//! distinct "skipped" outcome rather than success or failure.

pub mod arch;
pub mod os;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use arch::Arch;
pub use os::Os;

/// Platform identifier combining architecture and OS (e.g., "aarch64-darwin")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

impl Platform {
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Detect the current platform at runtime
  ///
  /// Returns `None` if the OS or architecture is not supported
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  /// Returns the platform triple string (e.g., "aarch64-darwin")
  pub fn triple(&self) -> String {
    format!("{}-{}", self.arch, self.os)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triple())
  }
}

/// Which platforms a dependency must be built on.
///
/// An empty list means "any" for that axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applicability {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub os: Vec<Os>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub arch: Vec<Arch>,
}

impl Applicability {
  pub fn any() -> Self {
    Self::default()
  }

  pub fn only_os(os: impl IntoIterator<Item = Os>) -> Self {
    Self {
      os: os.into_iter().collect(),
      arch: Vec::new(),
    }
  }

  pub fn is_unconstrained(&self) -> bool {
    self.os.is_empty() && self.arch.is_empty()
  }
}

/// Whether a dependency gated by `predicate` applies on `platform`.
///
/// An undetectable platform only satisfies an unconstrained predicate.
pub fn applicable(predicate: &Applicability, platform: Option<&Platform>) -> bool {
  let Some(platform) = platform else {
    return predicate.is_unconstrained();
  };

  let os_ok = predicate.os.is_empty() || predicate.os.contains(&platform.os);
  let arch_ok = predicate.arch.is_empty() || predicate.arch.contains(&platform.arch);
  os_ok && arch_ok
}

#[cfg(test)]
mod tests {
  use super::*;

  const LINUX_X86: Platform = Platform {
    arch: Arch::X86_64,
    os: Os::Linux,
  };
  const DARWIN_ARM: Platform = Platform {
    arch: Arch::Aarch64,
    os: Os::MacOs,
  };

  #[test]
  fn platform_triple_format() {
    assert_eq!(DARWIN_ARM.triple(), "aarch64-darwin");
    assert_eq!(LINUX_X86.triple(), "x86_64-linux");
  }

  #[test]
  fn unconstrained_applies_everywhere() {
    let any = Applicability::any();
    assert!(applicable(&any, Some(&LINUX_X86)));
    assert!(applicable(&any, Some(&DARWIN_ARM)));
    assert!(applicable(&any, None));
  }

  #[test]
  fn os_gate_excludes_other_os() {
    let linux_only = Applicability::only_os([Os::Linux]);
    assert!(applicable(&linux_only, Some(&LINUX_X86)));
    assert!(!applicable(&linux_only, Some(&DARWIN_ARM)));
  }

  #[test]
  fn both_axes_must_match() {
    let predicate = Applicability {
      os: vec![Os::Linux],
      arch: vec![Arch::Aarch64],
    };
    assert!(!applicable(&predicate, Some(&LINUX_X86)));
    assert!(applicable(
      &predicate,
      Some(&Platform::new(Arch::Aarch64, Os::Linux))
    ));
  }

  #[test]
  fn unknown_platform_fails_constrained_gate() {
    assert!(!applicable(&Applicability::only_os([Os::Linux]), None));
  }

  #[test]
  fn predicate_deserializes_with_aliases() {
    let predicate: Applicability = serde_json::from_str(r#"{"os": ["macos"], "arch": ["arm64"]}"#).unwrap();
    assert_eq!(predicate.os, vec![Os::MacOs]);
    assert_eq!(predicate.arch, vec![Arch::Aarch64]);
  }
}
