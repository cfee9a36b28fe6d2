//! Member path normalization and `Path.match`-style member patterns.
//!
//! Archive member names are stored with whatever separators the packing
//! tool used.  Every name is normalized once at index build time and every
//! lookup key is normalized the same way, so `audio\\sfx.fsb`,
//! `./audio//sfx.fsb` and `audio/x/../sfx.fsb` all resolve to
//! `audio/sfx.fsb`.

use glob::Pattern;

/// Separator used in normalized member paths.
pub const SEP: char = '/';

fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|c| !c.is_empty() && *c != ".")
}

/// Normalize a member path.
///
/// `\` and `/` are both separators, empty and `.` components are dropped,
/// `..` removes the preceding component (or is kept when there is nothing
/// left to remove) and a leading root is dropped.  The archive root is `""`.
pub fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in components(path) {
        if component == ".." {
            match out.last() {
                Some(&last) if last != ".." => {
                    out.pop();
                }
                _ => out.push(component),
            }
        } else {
            out.push(component);
        }
    }
    out.join("/")
}

/// Whether a normalized path would resolve outside the directory it is
/// joined onto: a `..` component, or a component carrying a drive or
/// stream prefix (`C:`), which `Path::join` would treat as absolute on
/// Windows.
pub fn escapes_root(normalized: &str) -> bool {
    components(normalized).any(|c| c == ".." || c.contains(':'))
}

/// Error produced when a member pattern cannot be compiled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid member pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason:  String,
}

/// A compiled member pattern.
///
/// A relative pattern matches when its components match the trailing
/// components of the path one for one, so `*.fsb` matches `audio/sfx.fsb`
/// and `*` matches every member.  A pattern with a leading separator must
/// match the whole path.  Each component supports `*`, `?` and `[...]`;
/// wildcards never cross a separator.
#[derive(Debug, Clone)]
pub struct MemberPattern {
    source:   String,
    anchored: bool,
    parts:    Vec<Pattern>,
}

impl MemberPattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let anchored = pattern.starts_with(['/', '\\']);
        let parts = components(pattern)
            .map(|c| {
                Pattern::new(c).map_err(|e| PatternError {
                    pattern: pattern.to_owned(),
                    reason:  e.msg.to_owned(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if parts.is_empty() {
            return Err(PatternError {
                pattern: pattern.to_owned(),
                reason:  "empty pattern".to_owned(),
            });
        }
        Ok(Self { source: pattern.to_owned(), anchored, parts })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match a normalized member path.
    pub fn matches(&self, path: &str) -> bool {
        let names: Vec<&str> = components(path).collect();
        if self.anchored {
            if names.len() != self.parts.len() {
                return false;
            }
        } else if names.len() < self.parts.len() {
            return false;
        }
        names
            .iter()
            .rev()
            .zip(self.parts.iter().rev())
            .all(|(name, part)| part.matches(name))
    }
}
