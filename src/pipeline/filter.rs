//! Path filtering for bulk runs.
//!
//! Two ordered glob lists: a path is kept iff it matches no `exclude`
//! pattern and either the `only` list is empty or at least one `only`
//! pattern matches. Glob tokens: `?` is a single non-slash character, `*` is
//! zero or more non-slash characters, `**` crosses slashes; everything else
//! is literal. Patterns compile to anchored regexes, so directory globs like
//! `a/*/b` work like any other pattern.

use anyhow::{Context, Result};
use regex::Regex;

/// Lowers one glob pattern to an anchored regex.
pub fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    regex.push_str(".*");
                } else {
                    regex.push_str("[^/]*");
                }
            }
            '?' => regex.push_str("[^/]"),
            literal => regex.push_str(&regex::escape(&literal.to_string())),
        }
    }

    regex.push('$');
    regex
}

pub struct PathFilter {
    only: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl PathFilter {
    pub fn new(only: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            only: compile_globs(only)?,
            exclude: compile_globs(exclude)?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        if self.exclude.iter().any(|pattern| pattern.is_match(path)) {
            return false;
        }

        self.only.is_empty() || self.only.iter().any(|pattern| pattern.is_match(path))
    }
}

fn compile_globs(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(&glob_to_regex(pattern))
                .with_context(|| format!("invalid glob pattern: {pattern}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        Regex::new(&glob_to_regex(pattern)).unwrap().is_match(path)
    }

    #[test]
    fn double_star_crosses_slashes() {
        assert!(matches("**.log", "a/b/c.log"));
        assert!(matches("**.log", "c.log"));
        assert!(matches("**", "anything/at/all"));
    }

    #[test]
    fn single_star_stays_within_a_segment() {
        assert!(matches("*.log", "c.log"));
        assert!(!matches("*.log", "a/b/c.log"));
        assert!(matches("a/*/b", "a/x/b"));
        assert!(!matches("a/*/b", "a/x/y/b"));
    }

    #[test]
    fn question_mark_never_matches_slash() {
        assert!(matches("a?c", "abc"));
        assert!(!matches("a?c", "a/c"));
    }

    #[test]
    fn literals_are_escaped() {
        assert!(matches("a.b", "a.b"));
        assert!(!matches("a.b", "axb"));
        assert!(matches("weird+name(1)", "weird+name(1)"));
    }

    #[test]
    fn empty_lists_keep_everything() {
        let filter = PathFilter::new(&[], &[]).unwrap();
        assert!(filter.matches("any/path"));
    }

    #[test]
    fn only_list_restricts() {
        let filter = PathFilter::new(&["**.log".to_string()], &[]).unwrap();
        assert!(filter.matches("a/b/c.log"));
        assert!(!filter.matches("a/b/c.txt"));
    }

    #[test]
    fn exclude_wins_over_only() {
        let filter = PathFilter::new(
            &["**.log".to_string()],
            &["tmp/**".to_string()],
        )
        .unwrap();
        assert!(filter.matches("a/b/c.log"));
        assert!(!filter.matches("tmp/c.log"));
    }

    #[test]
    fn invalid_pattern_is_impossible_to_build() {
        // Globs always compile: regex specials are escaped.
        assert!(PathFilter::new(&["[".to_string()], &[]).is_ok());
    }
}
