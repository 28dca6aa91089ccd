//! Placeholder substitution in build steps.
//!
//! Build step arguments, environment values and working directories may
//! reference values that are only known when the step runs.
//!
//! # Placeholder Formats
//!
//! - `$${name}` - the component name
//! - `$${version}` - the component's resolved version
//! - `$${install_dir}` - the shared install root
//! - `$${source_dir}` - where the component's source was acquired
//! - `$${build_dir}` - the component's scratch directory
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$PATH` work without escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use stackwright_lib::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("--prefix=$${install_dir}/embedded").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Literal("--prefix=".to_string()),
//!     Segment::Placeholder(Placeholder::InstallDir),
//!     Segment::Literal("/embedded".to_string()),
//! ]);
//! ```

use thiserror::Error;

/// A parsed placeholder reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
  Name,
  Version,
  InstallDir,
  SourceDir,
  BuildDir,
}

/// A segment of parsed text.
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
}

/// Supplies the values placeholders stand for.
pub trait Resolver {
  fn resolve(&self, placeholder: Placeholder) -> &str;
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

    if !matches!(chars.peek(), Some((_, '$'))) {
      literal.push('$');
      continue;
    }
    chars.next();

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if matches!(chars.peek(), Some((_, '{'))) {
          chars.next();
          literal.push_str("$${");
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

        segments.push(Segment::Placeholder(parse_placeholder(&content)?));
      }
      _ => literal.push_str("$$"),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content.trim() {
    "name" => Ok(Placeholder::Name),
    "version" => Ok(Placeholder::Version),
    "install_dir" => Ok(Placeholder::InstallDir),
    "source_dir" => Ok(Placeholder::SourceDir),
    "build_dir" => Ok(Placeholder::BuildDir),
    other => Err(PlaceholderError::Unknown(other.to_string())),
  }
}

/// Parse `input` and substitute every placeholder.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::with_capacity(input.len());
  for segment in parse(input)? {
    match segment {
      Segment::Literal(text) => result.push_str(&text),
      Segment::Placeholder(placeholder) => result.push_str(resolver.resolve(placeholder)),
    }
  }
  Ok(result)
}
