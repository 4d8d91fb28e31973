//! Glob pattern compilation.
//!
//! Patterns are translated once into an anchored [`regex::Regex`] so that a
//! malformed pattern is rejected before any backend is contacted, and so
//! that matching a listing page is a single regex test per key.
//!
//! Supported syntax over `/`-delimited names:
//!
//! | pattern   | matches                                              |
//! |-----------|------------------------------------------------------|
//! | `*`       | any run of characters except `/`                     |
//! | `**`      | as a whole segment: zero or more segments            |
//! | `?`       | one character except `/`                             |
//! | `[a-z]`   | one character from the class (`[!..]`/`[^..]` negate) |
//! | `{a,b}`   | either alternative; groups nest                      |
//! | `\x`      | the literal character `x`                            |

use regex::Regex;

use crate::errors::{Error, Result};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    /// Compile `pattern`, failing with [`Error::InvalidPattern`] on
    /// malformed input.
    pub fn new(pattern: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let translated = translate(pattern).map_err(invalid)?;
        let regex = Regex::new(&translated).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Whether `name` matches the whole pattern.
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn translate(pattern: &str) -> std::result::Result<String, String> {
    let chars: Vec<char> = pattern.chars().collect();
    let len = chars.len();
    let mut out = String::from("(?s)^");
    let mut depth = 0usize;
    let mut i = 0;

    while i < len {
        match chars[i] {
            '*' => {
                let mut j = i;
                while j < len && chars[j] == '*' {
                    j += 1;
                }
                let starts_segment = i == 0 || chars[i - 1] == '/';
                let ends_segment = j == len || chars[j] == '/';
                if j - i >= 2 && starts_segment && ends_segment {
                    if j == len {
                        out.push_str(".*");
                    } else {
                        // `**/` also matches zero directories.
                        out.push_str("(?:.*/)?");
                        j += 1;
                    }
                } else {
                    out.push_str("[^/]*");
                }
                i = j;
                continue;
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                i = translate_class(&chars, i, &mut out)?;
                continue;
            }
            '{' => {
                depth += 1;
                out.push_str("(?:");
            }
            '}' if depth > 0 => {
                depth -= 1;
                out.push(')');
            }
            ',' if depth > 0 => out.push('|'),
            '\\' => {
                i += 1;
                let escaped = chars
                    .get(i)
                    .ok_or_else(|| "trailing escape character".to_string())?;
                push_literal(&mut out, *escaped);
            }
            c => push_literal(&mut out, c),
        }
        i += 1;
    }

    if depth > 0 {
        return Err("unbalanced alternation group".to_string());
    }
    out.push('$');
    Ok(out)
}

/// Translate the class starting at `chars[start] == '['`; returns the index
/// just past the closing bracket.
fn translate_class(
    chars: &[char],
    start: usize,
    out: &mut String,
) -> std::result::Result<usize, String> {
    let mut i = start + 1;
    let negate = matches!(chars.get(i), Some('!') | Some('^'));
    if negate {
        i += 1;
    }

    let mut body = String::new();
    let mut members = 0usize;
    loop {
        let c = match chars.get(i) {
            None => return Err("unbalanced character class".to_string()),
            Some(']') => break,
            Some('\\') => {
                i += 1;
                *chars
                    .get(i)
                    .ok_or_else(|| "unbalanced character class".to_string())?
            }
            Some(c) => *c,
        };
        i += 1;

        // Range `lo-hi` unless the dash is the last member.
        if chars.get(i) == Some(&'-') && chars.get(i + 1).is_some_and(|n| *n != ']') {
            let mut hi = chars[i + 1];
            i += 2;
            if hi == '\\' {
                hi = *chars
                    .get(i)
                    .ok_or_else(|| "unbalanced character class".to_string())?;
                i += 1;
            }
            if hi < c {
                return Err(format!("invalid character range {c}-{hi}"));
            }
            body.push_str(&format!("\\x{{{:X}}}-\\x{{{:X}}}", c as u32, hi as u32));
        } else {
            body.push_str(&format!("\\x{{{:X}}}", c as u32));
        }
        members += 1;
    }

    if members == 0 {
        return Err("empty character class".to_string());
    }

    // Classes never match the segment separator.
    if negate {
        out.push_str("[^/");
        out.push_str(&body);
        out.push(']');
    } else {
        out.push('[');
        out.push_str(&body);
        out.push_str("&&[^/]]");
    }
    Ok(i + 1)
}

fn push_literal(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(pattern: &str, name: &str) -> bool {
        Pattern::new(pattern).unwrap().matches(name)
    }

    #[test]
    fn test_star_stays_in_segment() {
        assert!(m("a/*.txt", "a/x.txt"));
        assert!(!m("a/*.txt", "a/y.bin"));
        assert!(!m("a/*.txt", "a/b/z.txt"));
        assert!(m("*", "file"));
        assert!(!m("*", "dir/file"));
    }

    #[test]
    fn test_double_star() {
        assert!(m("a/**", "a/x.txt"));
        assert!(m("a/**", "a/b/z.txt"));
        assert!(!m("a/**", "b/x.txt"));
        assert!(m("**", "a/b/c"));
        assert!(m("**", "top"));
        assert!(m("**/*.txt", "x.txt"));
        assert!(m("**/*.txt", "a/b/x.txt"));
        assert!(m("a/**/z.txt", "a/z.txt"));
        assert!(m("a/**/z.txt", "a/b/c/z.txt"));
        assert!(!m("a/**/z.txt", "ab/z.txt"));
    }

    #[test]
    fn test_double_star_inside_segment_is_single_star() {
        assert!(m("a**b", "axxb"));
        assert!(!m("a**b", "a/b"));
    }

    #[test]
    fn test_question_mark() {
        assert!(m("file?.txt", "file1.txt"));
        assert!(!m("file?.txt", "file10.txt"));
        assert!(!m("a?b", "a/b"));
    }

    #[test]
    fn test_character_classes() {
        assert!(m("[abc].txt", "b.txt"));
        assert!(!m("[abc].txt", "d.txt"));
        assert!(m("[a-c]*", "cat"));
        assert!(m("[!a-c]*", "dog"));
        assert!(!m("[!a-c]*", "cat"));
        assert!(m("[^x]", "y"));
        assert!(!m("x[!y]z", "x/z"));
        assert!(m("[a-]", "-"));
    }

    #[test]
    fn test_class_escapes_regex_specials() {
        assert!(m("[.]", "."));
        assert!(!m("[.]", "a"));
        assert!(m("[\\]]", "]"));
    }

    #[test]
    fn test_alternation() {
        assert!(m("*.{txt,bin}", "a.txt"));
        assert!(m("*.{txt,bin}", "a.bin"));
        assert!(!m("*.{txt,bin}", "a.csv"));
        assert!(m("{a,b/{c,d}}.x", "b/d.x"));
    }

    #[test]
    fn test_literals_are_escaped() {
        assert!(m("a+b(1).txt", "a+b(1).txt"));
        assert!(!m("a.txt", "abtxt"));
        assert!(m("\\*", "*"));
        assert!(!m("\\*", "x"));
    }

    #[test]
    fn test_unbalanced_class_is_rejected() {
        let err = Pattern::new("a/[bc").unwrap_err();
        assert!(matches!(err, Error::InvalidPattern { .. }));
    }

    #[test]
    fn test_other_malformed_patterns_are_rejected() {
        for bad in ["{a,b", "a\\", "[]", "[z-a]"] {
            assert!(
                matches!(Pattern::new(bad), Err(Error::InvalidPattern { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_empty_pattern_matches_only_empty() {
        assert!(m("", ""));
        assert!(!m("", "a"));
    }

    #[test]
    fn test_class_never_matches_separator() {
        assert!(!m("a[/]b", "a/b"));
        assert!(!m("a[!-0]b", "a/b"));
        assert!(m("a[!-0]b", "a.b"));
        assert!(!m("a[!x]b", "a/b"));
        assert!(Pattern::new("a[/]b").is_ok());
    }

    #[test]
    fn test_stray_closing_brace_is_literal() {
        assert!(m("a}", "a}"));
    }
}
