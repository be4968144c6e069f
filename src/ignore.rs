//! Ignore-list parsing and frame matching.
//!
//! The list is newline-separated; `#` starts a comment that runs to end
//! of line, and all whitespace is stripped before parsing. Each entry is
//! a prefix plus a glob pattern (`*` and `?` wildcards):
//!
//! | Prefix | Applies to |
//! |---|---|
//! | `obj:` | object/binary file name |
//! | `src:` | source file path |
//! | `fun:` | function symbol |
//! | `fun_r:` | function and everything it transitively calls |
//! | `fun_hist:` | function whose frames are omitted from report stacks |
//!
//! Internally each entry becomes a (fun, obj, file) pattern triple; the
//! coordinates not named by the prefix stay at the bare wildcard. A
//! frame matches an entry when every non-empty coordinate matches,
//! except that a triple which is pure wildcard against all of the
//! frame's known coordinates matches nothing, so `src:*` alone cannot
//! suppress a frame that only has a function name.

use regex::Regex;
use thiserror::Error;

use crate::symbolize::Frame;

/// Ignore-list parse failure.
#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("unrecognized ignore entry on line {line}: `{entry}`")]
    UnknownPrefix { line: usize, entry: String },
    #[error("invalid glob pattern `{pattern}`: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },
}

/// A glob pattern compiled to an anchored regular expression.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    re: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self, IgnoreError> {
        let mut re = String::with_capacity(pattern.len() + 8);
        re.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        re.push('$');
        let re = Regex::new(&re).map_err(|source| IgnoreError::BadPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(GlobPattern {
            raw: pattern.to_string(),
            re,
        })
    }

    pub fn matches(&self, s: &str) -> bool {
        self.re.is_match(s)
    }

    /// Is this the bare `*` pattern that matches anything?
    pub fn is_wildcard(&self) -> bool {
        self.raw == "*"
    }
}

/// One ignore entry as a (fun, obj, file) pattern triple.
#[derive(Debug, Clone)]
pub struct IgnoreEntry {
    pub fun: GlobPattern,
    pub obj: GlobPattern,
    pub file: GlobPattern,
}

impl IgnoreEntry {
    fn with_fun(pattern: &str) -> Result<Self, IgnoreError> {
        Ok(IgnoreEntry {
            fun: GlobPattern::new(pattern)?,
            obj: GlobPattern::new("*")?,
            file: GlobPattern::new("*")?,
        })
    }

    fn with_obj(pattern: &str) -> Result<Self, IgnoreError> {
        Ok(IgnoreEntry {
            fun: GlobPattern::new("*")?,
            obj: GlobPattern::new(pattern)?,
            file: GlobPattern::new("*")?,
        })
    }

    fn with_file(pattern: &str) -> Result<Self, IgnoreError> {
        Ok(IgnoreEntry {
            fun: GlobPattern::new("*")?,
            obj: GlobPattern::new("*")?,
            file: GlobPattern::new(pattern)?,
        })
    }
}

/// Parsed ignore lists: plain suppression entries, recursive-ignore
/// entries, and history-frame entries.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    pub ignores: Vec<IgnoreEntry>,
    pub ignores_r: Vec<IgnoreEntry>,
    pub ignores_hist: Vec<IgnoreEntry>,
}

impl IgnoreSet {
    pub fn parse(text: &str) -> Result<IgnoreSet, IgnoreError> {
        let mut set = IgnoreSet::default();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line: String = raw_line
                .split('#')
                .next()
                .unwrap_or("")
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            if line.is_empty() {
                continue;
            }
            if let Some(tail) = line.strip_prefix("obj:") {
                set.ignores.push(IgnoreEntry::with_obj(tail)?);
            } else if let Some(tail) = line.strip_prefix("src:") {
                set.ignores.push(IgnoreEntry::with_file(tail)?);
            } else if let Some(tail) = line.strip_prefix("fun_r:") {
                set.ignores_r.push(IgnoreEntry::with_fun(tail)?);
            } else if let Some(tail) = line.strip_prefix("fun_hist:") {
                set.ignores_hist.push(IgnoreEntry::with_fun(tail)?);
            } else if let Some(tail) = line.strip_prefix("fun:") {
                set.ignores.push(IgnoreEntry::with_fun(tail)?);
            } else {
                return Err(IgnoreError::UnknownPrefix {
                    line: lineno + 1,
                    entry: line,
                });
            }
        }
        Ok(set)
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<IgnoreSet> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ignore file {}", path.display()))?;
        IgnoreSet::parse(&text).context("failed to parse ignore file")
    }

    /// Does the frame match a plain suppression entry?
    pub fn is_ignored(&self, frame: &Frame) -> bool {
        matches_frame(&self.ignores, frame)
    }

    /// Does the frame match a recursive-ignore entry?
    pub fn is_recursive_ignored(&self, frame: &Frame) -> bool {
        matches_frame(&self.ignores_r, frame)
    }

    /// Should the frame be omitted from report stacks?
    pub fn is_history_ignored(&self, frame: &Frame) -> bool {
        matches_frame(&self.ignores_hist, frame)
    }

    pub fn is_empty(&self) -> bool {
        self.ignores.is_empty() && self.ignores_r.is_empty() && self.ignores_hist.is_empty()
    }
}

/// A frame matches an entry when every non-empty coordinate matches its
/// pattern; an entry that is pure wildcard against all the frame's known
/// coordinates never matches.
fn matches_frame(entries: &[IgnoreEntry], frame: &Frame) -> bool {
    let fun = frame.function.as_deref().unwrap_or("");
    let obj = frame.object.as_deref().unwrap_or("");
    let file = frame.file.as_deref().unwrap_or("");
    for entry in entries {
        let coords_match = (fun.is_empty() || entry.fun.matches(fun))
            && (obj.is_empty() || entry.obj.matches(obj))
            && (file.is_empty() || entry.file.matches(file));
        if !coords_match {
            continue;
        }
        let trivially = (fun.is_empty() || entry.fun.is_wildcard())
            && (obj.is_empty() || entry.obj.is_wildcard())
            && (file.is_empty() || entry.file.is_wildcard());
        if !trivially {
            return true;
        }
    }
    false
}
