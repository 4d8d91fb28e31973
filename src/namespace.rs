//! Namespace prefixing.
//!
//! A bucket may be scoped to a subtree of the backend key space.  Every
//! object name is cleaned and joined under the prefix before it reaches the
//! backend, and listing results have the prefix stripped before they reach
//! the caller.

/// Key separator used by every backend.
pub const SEPARATOR: char = '/';

/// A normalized key prefix: empty, or ending in exactly one `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Normalize `prefix`: leading separators are dropped and, when the
    /// result is non-empty, exactly one trailing separator is kept.
    ///
    /// Traversal segments inside the prefix itself are collapsed too.
    pub fn new(prefix: &str) -> Self {
        let cleaned = clean(prefix);
        let prefix = if cleaned.is_empty() {
            cleaned
        } else {
            format!("{cleaned}{SEPARATOR}")
        };
        Self { prefix }
    }

    /// The normalized prefix string.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }

    /// Resolve a relative object name to its backend key.
    ///
    /// `.`/`..`/empty segments are collapsed as if `name` were rooted at the
    /// prefix, so the result never escapes the namespace.
    pub fn with_prefix(&self, name: &str) -> String {
        format!("{}{}", self.prefix, clean(name))
    }

    /// Strip the prefix (and one following separator) from a backend key.
    /// Keys outside the namespace are returned unchanged.
    pub fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            return key;
        }
        match key.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.strip_prefix(SEPARATOR).unwrap_or(rest),
            None => key,
        }
    }

    /// Whether `key` lies inside this namespace.
    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(self.prefix.as_str())
    }
}

/// Clean a slash-separated name as if it were rooted at `/`.
///
/// `a/./b` -> `a/b`, `../../etc/passwd` -> `etc/passwd`, `a//b/` -> `a/b`.
pub fn clean(name: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in name.split(SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}
