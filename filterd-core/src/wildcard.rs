//! Glob patterns compiled to anchored regular expressions.
//!
//! `*` matches any run of characters and `?` exactly one character; everything else
//! is matched literally. Each pattern also keeps its longest wildcard-free segment
//! (the shortcut) so most non-matching inputs are rejected by a substring scan
//! before the regex runs.

use regex::{Regex, RegexBuilder};
use std::fmt;

const WILDCARD_CHARS: [char; 2] = ['*', '?'];

/// A compiled wildcard pattern
#[derive(Debug, Clone)]
pub struct Wildcard {
    regex: Regex,
    shortcut: String,
    case_insensitive: bool,
}

impl Wildcard {
    /// Compiles a case-insensitive pattern.
    ///
    /// ```
    /// use filterd_core::wildcard::Wildcard;
    ///
    /// let wildcard = Wildcard::new("*.example.com").unwrap();
    /// assert!(wildcard.matches("ads.EXAMPLE.com"));
    /// assert!(!wildcard.matches("example.com.evil.org"));
    /// ```
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Self::with_case(pattern, true)
    }

    pub fn with_case(pattern: &str, case_insensitive: bool) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(&wildcard_to_regex(pattern))
            .case_insensitive(case_insensitive)
            .build()?;

        let shortcut = extract_shortcut(pattern);
        let shortcut = if case_insensitive {
            shortcut.to_lowercase()
        } else {
            shortcut.to_string()
        };

        Ok(Self {
            regex,
            shortcut,
            case_insensitive,
        })
    }

    /// Longest literal segment of the pattern, lower-cased for case-insensitive patterns
    pub fn shortcut(&self) -> &str {
        &self.shortcut
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    /// Returns true if the whole input matches the pattern
    pub fn matches(&self, input: &str) -> bool {
        if input.is_empty() {
            return false;
        }

        let has_shortcut = if self.case_insensitive {
            input.to_lowercase().contains(&self.shortcut)
        } else {
            input.contains(&self.shortcut)
        };

        if !has_shortcut {
            return false;
        }

        self.regex.is_match(input)
    }
}

impl fmt::Display for Wildcard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.regex.as_str())
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2 + 2);
    regex.push('^');
    let mut literal = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            _ => regex.push_str(&regex::escape(c.encode_utf8(&mut literal))),
        }
    }
    regex.push('$');
    regex
}

/// First longest segment that contains neither `*` nor `?`
fn extract_shortcut(pattern: &str) -> &str {
    pattern
        .split(WILDCARD_CHARS)
        .fold("", |longest, segment| {
            if segment.len() > longest.len() {
                segment
            } else {
                longest
            }
        })
}
