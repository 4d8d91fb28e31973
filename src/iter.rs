//! Lazy, paginated, pattern-filtered object iteration.
//!
//! Backends only implement [`PageSource`]: fetch one raw page of keys for a
//! continuation token.  [`ObjectIter`] owns the shared protocol on top of
//! it: strip the namespace prefix, match the glob, buffer matches, fetch the
//! next page when the buffer runs dry, and make errors sticky.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::{Error, Result};
use crate::glob::Pattern;
use crate::namespace::Namespace;
use crate::storage::backend::BoxFuture;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Name relative to the bucket namespace (raw backend key inside a
    /// [`Page`]).
    pub name: String,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

/// A raw listing page as returned by a backend.
#[derive(Debug, Default)]
pub struct Page {
    /// Entries carrying full backend keys.
    pub entries: Vec<ObjectEntry>,
    /// Continuation token; `None` marks the last page.
    pub next_token: Option<String>,
}

/// Backend-specific page fetcher.
pub trait PageSource: Send + 'static {
    /// Fetch the page identified by `token` (`None` for the first page).
    fn fetch_page(&mut self, token: Option<String>) -> BoxFuture<'_, Result<Page>>;
}

/// Cursor over the objects matching a glob pattern.
///
/// Not restartable: once exhausted, closed, or failed, [`next`] keeps
/// returning `false`.
///
/// [`next`]: ObjectIter::next
pub struct ObjectIter {
    source: Box<dyn PageSource>,
    namespace: Namespace,
    pattern: Pattern,
    token: Option<String>,
    page: VecDeque<ObjectEntry>,
    current: Option<ObjectEntry>,
    last: bool,
    err: Option<Error>,
}

impl ObjectIter {
    pub fn new(source: impl PageSource, namespace: Namespace, pattern: Pattern) -> Self {
        Self {
            source: Box::new(source),
            namespace,
            pattern,
            token: None,
            page: VecDeque::new(),
            current: None,
            last: false,
            err: None,
        }
    }

    /// Advance the cursor, fetching further pages as needed.
    pub async fn next(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }

        loop {
            if let Some(entry) = self.page.pop_front() {
                self.current = Some(entry);
                return true;
            }
            self.current = None;

            if self.last {
                return false;
            }

            if let Err(err) = self.fetch_next_page().await {
                self.err = Some(err);
                self.last = true;
                return false;
            }
        }
    }

    async fn fetch_next_page(&mut self) -> Result<()> {
        let page = self.source.fetch_page(self.token.take()).await?;

        debug!(
            "listing page: prefix='{}' entries={} more={}",
            self.namespace.prefix(),
            page.entries.len(),
            page.next_token.is_some()
        );

        self.last = page.next_token.is_none();
        self.token = page.next_token;

        for mut entry in page.entries {
            if !self.namespace.contains(&entry.name) {
                continue;
            }
            let name = self.namespace.strip_prefix(&entry.name).to_string();
            if self.pattern.matches(&name) {
                entry.name = name;
                self.page.push_back(entry);
            }
        }
        Ok(())
    }

    /// The entry at the cursor.
    pub fn current(&self) -> Option<&ObjectEntry> {
        self.current.as_ref()
    }

    /// Name at the cursor, or `""`.
    pub fn name(&self) -> &str {
        self.current.as_ref().map_or("", |e| e.name.as_str())
    }

    /// Size at the cursor, or 0.
    pub fn size(&self) -> u64 {
        self.current.as_ref().map_or(0, |e| e.size)
    }

    /// Modification time at the cursor, or the Unix epoch.
    pub fn mod_time(&self) -> DateTime<Utc> {
        self.current
            .as_ref()
            .map_or_else(DateTime::<Utc>::default, |e| e.mod_time)
    }

    /// The sticky iteration error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Stop iteration.  Idempotent.
    pub fn close(&mut self) {
        self.last = true;
        self.page.clear();
        self.current = None;
        self.token = None;
    }

    /// The pattern this iterator filters by.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Drain the iterator, returning every remaining entry or the first
    /// error.
    pub async fn collect_entries(mut self) -> Result<Vec<ObjectEntry>> {
        let mut out = Vec::new();
        while self.next().await {
            if let Some(entry) = self.current.take() {
                out.push(entry);
            }
        }
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    /// Drain the iterator, returning names only.
    pub async fn collect_names(self) -> Result<Vec<String>> {
        Ok(self
            .collect_entries()
            .await?
            .into_iter()
            .map(|e| e.name)
            .collect())
    }
}

impl std::fmt::Debug for ObjectIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectIter")
            .field("namespace", &self.namespace)
            .field("pattern", &self.pattern.as_str())
            .field("buffered", &self.page.len())
            .field("last", &self.last)
            .field("err", &self.err)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serves fixed pages; optionally fails on a given page index.
    struct FakePages {
        pages: Vec<Vec<&'static str>>,
        fail_at: Option<usize>,
        calls: Arc<AtomicUsize>,
    }

    impl PageSource for FakePages {
        fn fetch_page(&mut self, token: Option<String>) -> BoxFuture<'_, Result<Page>> {
            Box::pin(async move {
                let idx: usize = token.map(|t| t.parse().unwrap()).unwrap_or(0);
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail_at == Some(idx) {
                    return Err(Error::opaque("fake list", "boom"));
                }
                let entries = self.pages[idx]
                    .iter()
                    .map(|k| ObjectEntry {
                        name: k.to_string(),
                        size: k.len() as u64,
                        mod_time: Utc::now(),
                    })
                    .collect();
                let next_token = (idx + 1 < self.pages.len()).then(|| (idx + 1).to_string());
                Ok(Page {
                    entries,
                    next_token,
                })
            })
        }
    }

    fn iter(
        pages: Vec<Vec<&'static str>>,
        prefix: &str,
        pattern: &str,
    ) -> (ObjectIter, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let src = FakePages {
            pages,
            fail_at: None,
            calls: calls.clone(),
        };
        let it = ObjectIter::new(src, Namespace::new(prefix), Pattern::new(pattern).unwrap());
        (it, calls)
    }

    #[tokio::test]
    async fn test_iterates_across_pages() {
        let (it, calls) = iter(
            vec![vec!["p/a.txt", "p/b.bin"], vec![], vec!["p/c.txt"]],
            "p",
            "*.txt",
        );
        let names = it.collect_names().await.unwrap();
        assert_eq!(names, vec!["a.txt", "c.txt"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lazy_until_first_next() {
        let (mut it, calls) = iter(vec![vec!["a"]], "", "**");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(it.next().await);
        assert_eq!(it.name(), "a");
        assert_eq!(it.size(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!it.next().await);
        assert!(!it.next().await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_sticky() {
        let calls = Arc::new(AtomicUsize::new(0));
        let src = FakePages {
            pages: vec![vec!["a"], vec!["b"], vec!["c"]],
            fail_at: Some(1),
            calls: calls.clone(),
        };
        let mut it = ObjectIter::new(src, Namespace::default(), Pattern::new("*").unwrap());
        assert!(it.next().await);
        assert!(!it.next().await);
        assert!(it.error().is_some());
        assert!(!it.next().await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(it.name(), "");
    }

    #[tokio::test]
    async fn test_close_stops_fetching() {
        let (mut it, calls) = iter(vec![vec!["a", "b"], vec!["c"]], "", "*");
        assert!(it.next().await);
        it.close();
        it.close();
        assert!(!it.next().await);
        assert!(it.error().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keys_outside_namespace_are_skipped() {
        let (it, _) = iter(vec![vec!["x/a", "y/b", "x/c"]], "x", "**");
        let names = it.collect_names().await.unwrap();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_collect_entries_reports_error() {
        let src = FakePages {
            pages: vec![vec!["a"]],
            fail_at: Some(0),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let it = ObjectIter::new(src, Namespace::default(), Pattern::new("*").unwrap());
        assert!(it.collect_entries().await.is_err());
    }
}
