//! Glob-to-predicate compiler for artifact collection and upload validation.
//!
//! Implements the grammar in Section 4.4:
//! - `**` matches any sequence including path separators; optionally
//!   consumes a following `/`.
//! - `*` matches any sequence excluding `/`.
//! - `?` matches any single non-`/` character.
//! - `.` and all regex metacharacters are treated literally.
//! - Match is anchored (full-name equality).

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlobError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A compiled glob pattern, ready to test candidate paths against.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile `pattern` per the Section 4.4 grammar.
    pub fn compile(pattern: &str) -> Result<Self, GlobError> {
        let regex_src = translate(pattern);
        let regex = Regex::new(&regex_src).map_err(|source| GlobError::Invalid {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.source
    }

    /// True if `candidate` (a `/`-separated relative path) matches this pattern.
    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

/// Compile a whole pattern set, short-circuiting on the first invalid pattern.
pub fn compile_all(patterns: &[String]) -> Result<Vec<GlobPattern>, GlobError> {
    patterns.iter().map(|p| GlobPattern::compile(p)).collect()
}

/// True if `candidate` matches any pattern in `patterns`.
pub fn matches_any(patterns: &[GlobPattern], candidate: &str) -> bool {
    patterns.iter().any(|p| p.matches(candidate))
}

/// Translate one glob pattern into an anchored regex source string.
fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    // `**` matches any sequence including separators, and
                    // optionally consumes a following `/`.
                    out.push_str("(?:.*)");
                    i += 2;
                    if i < chars.len() && chars[i] == '/' {
                        out.push_str("/?");
                        i += 1;
                    }
                    continue;
                }
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            c => {
                if regex_metachar(c) {
                    out.push('\\');
                }
                out.push(c);
                i += 1;
            }
        }
    }

    out.push('$');
    out
}

fn regex_metachar(c: char) -> bool {
    matches!(
        c,
        '.' | '+' | '(' | ')' | '|' | '^' | '$' | '[' | ']' | '{' | '}' | '\\'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, candidate: &str) -> bool {
        GlobPattern::compile(pattern).unwrap().matches(candidate)
    }

    #[test]
    fn double_star_matches_any_depth() {
        assert!(matches("**/*.txt", "a/b.txt"));
        assert!(!matches("**/*.txt", "a/b.md"));
    }

    #[test]
    fn single_star_excludes_separator() {
        assert!(matches("*.txt", "out.txt"));
        assert!(!matches("*.txt", "a/out.txt"));
    }

    #[test]
    fn question_mark_matches_single_non_separator_char() {
        assert!(matches("?.log", "a.log"));
        assert!(!matches("?.log", "ab.log"));
    }

    #[test]
    fn double_star_between_segments_matches_zero_or_more_dirs() {
        assert!(matches("x/**/y", "x/y"));
        assert!(matches("x/**/y", "x/a/y"));
        assert!(matches("x/**/y", "x/a/b/y"));
    }

    #[test]
    fn literal_dot_does_not_act_as_wildcard() {
        assert!(matches("a.txt", "a.txt"));
        assert!(!matches("a.txt", "aXtxt"));
    }

    #[test]
    fn match_is_fully_anchored() {
        assert!(!matches("*.txt", "out.txt.bak"));
        assert!(!matches("*.txt", "prefix-out.txt-suffix"));
    }

    #[test]
    fn matches_any_checks_whole_set() {
        let set = compile_all(&["*.txt".to_string(), "**/*.log".to_string()]).unwrap();
        assert!(matches_any(&set, "readme.txt"));
        assert!(matches_any(&set, "logs/a/b.log"));
        assert!(!matches_any(&set, "evil.exe"));
    }
}
