//! Placeholders in build step programs and arguments.
//!
//! Build steps are declared before the run knows where its workspace lives,
//! so step arguments refer to run-specific paths through placeholders that
//! are substituted just before each invocation.
//!
//! # Placeholder Formats
//!
//! - `$${prefix}` - the installation prefix
//! - `$${source}` - the unpacked or checked-out source root
//! - `$${build}` - the dedicated build directory (source root when unset)
//! - `$${workspace}` - the run's workspace root
//! - `$${dep:<name>}` - the installation prefix of a plan dependency
//!
//! Single `$` characters pass through unchanged, so `$CC` or `$(nproc)`
//! reach the toolchain as written. `$$${` produces a literal `$${`.
//!
//! ```
//! use nativeboot_lib::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("--prefix=$${prefix}").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Literal("--prefix=".to_string()),
//!     Segment::Placeholder(Placeholder::Prefix),
//! ]);
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Prefix,
  Source,
  Build,
  Workspace,
  Dep(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("no installation prefix known for dependency '{0}'")]
  UnresolvedDep(String),
}

/// Supplies the values placeholders stand for during one run.
pub trait Resolver {
  fn resolve_prefix(&self) -> &str;
  fn resolve_source(&self) -> &str;
  fn resolve_build(&self) -> &str;
  fn resolve_workspace(&self) -> &str;
  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();

        match chars.peek() {
          Some((_, '$')) => {
            chars.next();
            if let Some((_, '{')) = chars.peek() {
              // $$${ is the escape for a literal $${
              literal.push_str("$${");
              chars.next();
            } else {
              literal.push_str("$$$");
            }
          }
          Some((_, '{')) => {
            chars.next();

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut content = String::new();
            let mut closed = false;
            for (_, c) in chars.by_ref() {
              if c == '}' {
                closed = true;
                break;
              }
              content.push(c);
            }

            if !closed {
              return Err(PlaceholderError::Unclosed(pos));
            }

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content {
    "prefix" => return Ok(Placeholder::Prefix),
    "source" => return Ok(Placeholder::Source),
    "build" => return Ok(Placeholder::Build),
    "workspace" => return Ok(Placeholder::Workspace),
    _ => {}
  }

  match content.split_once(':') {
    Some(("dep", name)) if !name.is_empty() => Ok(Placeholder::Dep(name.to_string())),
    Some(("dep", _)) => Err(PlaceholderError::Malformed(format!("dependency name missing in '{content}'"))),
    _ => Err(PlaceholderError::Unknown(content.to_string())),
  }
}

/// Parse `input` and substitute every placeholder.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  let mut result = String::with_capacity(input.len());

  for segment in &segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => {
        let value = match p {
          Placeholder::Prefix => resolver.resolve_prefix(),
          Placeholder::Source => resolver.resolve_source(),
          Placeholder::Build => resolver.resolve_build(),
          Placeholder::Workspace => resolver.resolve_workspace(),
          Placeholder::Dep(name) => resolver.resolve_dep(name)?,
        };
        result.push_str(value);
      }
    }
  }

  Ok(result)
}
