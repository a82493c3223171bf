//! Mapping configuration directives.
//!
//! The configuration is line oriented. Every non-blank line holds a keyword
//! followed by whitespace separated operands:
//!
//! ```text
//! mapping-prefix 64:ff9b::
//! map-static     192.0.2.10   2001:db8::10
//! map66-static   fd00::10     2001:db8:1::10
//! include        extra.conf
//! ```
//!
//! Lines whose first token starts with `#` are comments. Operands are kept
//! as text here; address validation happens when the directives are loaded
//! into a mapping table so that a bad line can be reported and skipped.

use crate::error::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Maximum nesting of `include` directives before loading fails.
pub const INCLUDE_DEPTH_LIMIT: usize = 10;

/// One parsed configuration line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// File the line came from, if it was read from disk.
    pub file: Option<Arc<Path>>,
    /// 1-based line number.
    pub line: usize,
    pub kind: DirectiveKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveKind {
    /// `map-static <ipv4> <ipv6>`
    MapStatic { ipv4: String, ipv6: String },
    /// `map66-static <internal ipv6> <global ipv6>`
    Map66Static { internal: String, global: String },
    /// `mapping-prefix <ipv6>`
    MappingPrefix(String),
    /// `include <path>`, already resolved against the including file.
    Include(PathBuf),
    /// A known keyword with the wrong number of operands.
    Malformed { keyword: String, expected: usize },
    /// Any other keyword.
    Unknown(String),
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}", file.display(), self.line),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// Parse configuration text.
///
/// `file` is the path the text was read from; relative `include` operands
/// are resolved against its parent directory.
pub fn parse_directives(text: &str, file: Option<&Path>) -> Vec<Directive> {
    let file: Option<Arc<Path>> = file.map(Arc::from);
    let base_dir = file.as_deref().and_then(Path::parent);

    text.lines()
        .enumerate()
        .filter_map(|(index, line)| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let (keyword, operands) = tokens.split_first()?;
            if keyword.starts_with('#') {
                return None;
            }
            Some(Directive {
                file: file.clone(),
                line: index + 1,
                kind: parse_kind(keyword, operands, base_dir),
            })
        })
        .collect()
}

/// Read and parse a configuration file.
pub fn read_directives(path: &Path) -> Result<Vec<Directive>> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_directives(&text, Some(path)))
}

fn parse_kind(keyword: &str, operands: &[&str], base_dir: Option<&Path>) -> DirectiveKind {
    let malformed = |expected| DirectiveKind::Malformed {
        keyword: keyword.to_string(),
        expected,
    };

    match (keyword, operands) {
        ("map-static", [ipv4, ipv6]) => DirectiveKind::MapStatic {
            ipv4: ipv4.to_string(),
            ipv6: ipv6.to_string(),
        },
        ("map66-static", [internal, global]) => DirectiveKind::Map66Static {
            internal: internal.to_string(),
            global: global.to_string(),
        },
        ("mapping-prefix", [prefix]) => DirectiveKind::MappingPrefix(prefix.to_string()),
        ("include", [path]) => {
            let path = Path::new(path);
            let resolved = match base_dir {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.to_path_buf(),
            };
            DirectiveKind::Include(resolved)
        }
        ("map-static" | "map66-static", _) => malformed(2),
        ("mapping-prefix" | "include", _) => malformed(1),
        (other, _) => DirectiveKind::Unknown(other.to_string()),
    }
}
