//! Gitignore style matching of single file names.
//!
//! Matching is done by `glob::Pattern`. On top of its syntax, `\` escapes the next
//! character and `[^abc]` is accepted for `[!abc]`. A leading dot is only matched by
//! a literal dot, so `*` does not pick up hidden files.

use glob::{MatchOptions, Pattern};

/// Rewrite gitignore syntax into the dialect of `glob::Pattern`.
fn translate(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut prev_star = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(e @ ('*' | '?' | '[')) => {
                    out.push('[');
                    out.push(e);
                    out.push(']');
                }
                Some(e) => out.push(e),
                None => out.push('\\'),
            },
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('!');
                }
            }
            // names have no separators, `**` is just `*`
            '*' if prev_star => {}
            c => out.push(c),
        }
        prev_star = c == '*';
    }
    out
}

/// A compiled name pattern
#[derive(Clone, Debug)]
pub struct NamePattern {
    pattern: Option<Pattern>,
    options: MatchOptions,
}

impl NamePattern {
    /// Compile `pattern`. A pattern glob can't parse, such as one with an unterminated
    /// class, matches itself literally.
    pub fn new(pattern: &str, ignore_case: bool) -> NamePattern {
        let pattern = Pattern::new(&translate(pattern))
            .or_else(|_| Pattern::new(&Pattern::escape(pattern)))
            .ok();
        NamePattern {
            pattern,
            options: MatchOptions {
                case_sensitive: !ignore_case,
                require_literal_leading_dot: true,
                ..MatchOptions::new()
            },
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|p| p.matches_with(name, self.options))
    }
}
