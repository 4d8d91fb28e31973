//! Local filesystem bucket.
//!
//! Objects are stored as regular files under a root directory; the
//! namespaced key is used directly as a relative path (e.g. `prefix/a/b.txt`).
//! Directories are created on demand, never listed, and pruned once
//! empty.  The `.tmp` tree at the root is reserved.
//!
//! Commits follow crash-only design: copy the staged file to a temp file
//! under `{root}/.tmp`, fsync, rename over the destination.  Content type and
//! user metadata are not persisted by this backend.

use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::backend::{BoxFuture, Bucket, MetaInfo, WriteOptions};
use crate::errors::{Error, Result};
use crate::glob::Pattern;
use crate::iter::{ObjectEntry, ObjectIter, Page, PageSource};
use crate::metrics;
use crate::namespace::{self, Namespace};
use crate::reader::ObjectReader;
use crate::writer::{Publisher, StagedObject, Writer};

const BACKEND: &str = "file";

/// Directory under the root used for atomic renames; never listed.
const TMP_DIR: &str = ".tmp";

/// Default number of entries per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Whether `key` lies in the staging tree under the root.
fn is_reserved(key: &str) -> bool {
    key == TMP_DIR
        || key
            .strip_prefix(TMP_DIR)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Filesystem paths shared by the bucket, its writers and its iterators.
#[derive(Debug)]
struct LocalRoot {
    root: PathBuf,
}

impl LocalRoot {
    /// Resolve a backend key to an absolute file path.
    ///
    /// Keys are already cleaned by the namespace; this additionally rejects
    /// any `..` component, the reserved `.tmp` tree, and anything whose
    /// nearest existing ancestor resolves outside the root through a
    /// symlink.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        for component in Path::new(key).components() {
            if let Component::ParentDir = component {
                return Err(Error::InvalidName(key.to_string()));
            }
        }
        if is_reserved(key) {
            return Err(Error::InvalidName(key.to_string()));
        }

        let path = self.root.join(key);
        self.ensure_contained(&path)
            .map_err(|_| Error::InvalidName(key.to_string()))?;
        Ok(path)
    }

    /// Check that the deepest existing ancestor of `path` (or `path`
    /// itself) canonicalizes to a location under the root.
    fn ensure_contained(&self, path: &Path) -> Result<()> {
        let canonical_root = self.root.canonicalize()?;
        let existing = path
            .ancestors()
            .find(|p| p.symlink_metadata().is_ok())
            .unwrap_or(self.root.as_path());
        let canonical = existing.canonicalize()?;
        if canonical.starts_with(&canonical_root) {
            Ok(())
        } else {
            Err(Error::InvalidName(path.display().to_string()))
        }
    }

    /// Generate a temp file path under .tmp/ for atomic writes.
    fn temp_path(&self) -> PathBuf {
        let id = uuid::Uuid::new_v4();
        self.root.join(TMP_DIR).join(format!("tmp-{id}"))
    }

    /// Copy `src` over `dst` via temp-fsync-rename.
    fn replace_with_copy(&self, src: &Path, dst: &Path) -> Result<()> {
        self.ensure_contained(dst)?;
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.temp_path();
        if let Some(parent) = tmp_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let result = (|| -> std::io::Result<()> {
            let mut input = std::fs::File::open(src)?;
            let mut output = std::fs::File::create(&tmp_path)?;
            std::io::copy(&mut input, &mut output)?;
            output.flush()?;
            output.sync_all()?;
            self.ensure_contained(dst).map_err(std::io::Error::other)?;
            match std::fs::rename(&tmp_path, dst) {
                // A concurrent remove pruned the freshly created parent.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if let Some(parent) = dst.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    self.ensure_contained(dst).map_err(std::io::Error::other)?;
                    std::fs::rename(&tmp_path, dst)
                }
                other => other,
            }
        })();

        if result.is_err() {
            if let Err(e) = std::fs::remove_file(&tmp_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove temp file {:?}: {}", tmp_path, e);
                }
            }
        }
        result.map_err(|e| match e.downcast::<Error>() {
            Ok(err) => err,
            Err(e) => e.into(),
        })
    }

    /// Remove now-empty directories from `dir` upwards, stopping at the
    /// root or at the first directory that still has entries.
    fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
        while let Some(d) = dir {
            if d == self.root.as_path() || !d.starts_with(&self.root) {
                break;
            }
            match std::fs::remove_dir(d) {
                Ok(()) => debug!("fs prune: {:?}", d),
                Err(_) => break,
            }
            dir = d.parent();
        }
    }

    /// Backend key for a path under the root, with `/` separators.
    fn key_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

/// Stores objects on the local filesystem.
pub struct LocalBucket {
    root: Arc<LocalRoot>,
    namespace: Namespace,
    page_size: usize,
}

impl LocalBucket {
    /// Create a bucket rooted at `root`, scoped to `prefix`.
    ///
    /// The root directory will be created if it does not exist.
    pub fn new(root: impl Into<PathBuf>, prefix: &str) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        // Also create the .tmp directory for atomic writes.
        std::fs::create_dir_all(root.join(TMP_DIR))?;

        let namespace = Namespace::new(prefix);
        info!(
            "Local bucket initialized: root={:?} prefix='{}'",
            root,
            namespace.prefix()
        );

        Ok(Self {
            root: Arc::new(LocalRoot { root }),
            namespace,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Set the number of entries returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root.root
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Resolve a relative name to a path, refusing the namespace root.
    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if namespace::clean(name).is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        self.root.resolve(&self.namespace.with_prefix(name))
    }

    /// Like [`Self::object_path`], but the namespace root and the staging
    /// tree are simply absent.
    fn lookup(&self, name: &str) -> Result<PathBuf> {
        let key = self.namespace.with_prefix(name);
        if namespace::clean(name).is_empty() || is_reserved(&key) {
            return Err(Error::NotFound);
        }
        self.root.resolve(&key)
    }
}

impl Bucket for LocalBucket {
    fn glob(&self, pattern: &str) -> Result<ObjectIter> {
        let pattern = Pattern::new(pattern)?;
        let source = LocalPages {
            root: self.root.clone(),
            prefix: self.namespace.prefix().to_string(),
            page_size: self.page_size,
            scanned: None,
        };
        Ok(ObjectIter::new(source, self.namespace.clone(), pattern))
    }

    fn head(&self, name: &str) -> BoxFuture<'_, Result<MetaInfo>> {
        let name = namespace::clean(name);
        metrics::observe(BACKEND, "head", async move {
            let path = self.lookup(&name)?;
            debug!("fs stat: {:?}", path);

            let meta = tokio::fs::metadata(&path).await?;
            if !meta.is_file() {
                return Err(Error::NotFound);
            }

            Ok(MetaInfo {
                name,
                size: meta.len(),
                mod_time: meta.modified().map(DateTime::<Utc>::from)?,
                content_type: String::new(),
                metadata: Default::default(),
            })
        })
        .boxed()
    }

    fn open(&self, name: &str) -> BoxFuture<'_, Result<ObjectReader>> {
        let name = name.to_string();
        metrics::observe(BACKEND, "open", async move {
            let path = self.lookup(&name)?;
            debug!("fs open: {:?}", path);

            let file = tokio::fs::File::open(&path).await?;
            let meta = file.metadata().await?;
            if !meta.is_file() {
                return Err(Error::NotFound);
            }
            Ok(ObjectReader::new(file, meta.len()))
        })
        .boxed()
    }

    fn create(&self, name: &str, opts: WriteOptions) -> BoxFuture<'_, Result<Writer>> {
        let name = name.to_string();
        Box::pin(async move {
            // Validate up front so a bad name fails before bytes are staged.
            self.object_path(&name)?;
            let key = self.namespace.with_prefix(&name);
            let publisher: Arc<dyn Publisher> = Arc::new(LocalPublisher {
                root: self.root.clone(),
            });
            Writer::new(name, key, opts, publisher)
        })
    }

    fn remove(&self, name: &str) -> BoxFuture<'_, Result<()>> {
        let name = name.to_string();
        metrics::observe(BACKEND, "remove", async move {
            let path = match self.lookup(&name) {
                Ok(path) => path,
                Err(Error::NotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
            debug!("fs remove: {:?}", path);

            // Idempotent: a missing file or a directory names no object.
            match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) if meta.is_dir() => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            self.root.prune_empty_dirs(path.parent());
            Ok(())
        })
        .boxed()
    }

    fn copy(&self, src: &str, dst: &str) -> BoxFuture<'_, Result<()>> {
        let src = src.to_string();
        let dst = dst.to_string();
        metrics::observe(BACKEND, "copy", async move {
            let src_path = self.lookup(&src)?;
            if !src_path.is_file() {
                return Err(Error::NotFound);
            }
            let dst_path = self.object_path(&dst)?;

            debug!("fs copy: {:?} -> {:?}", src_path, dst_path);
            self.root.replace_with_copy(&src_path, &dst_path)
        })
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Moves committed files into place.
struct LocalPublisher {
    root: Arc<LocalRoot>,
}

impl Publisher for LocalPublisher {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn publish<'a>(
        &'a self,
        key: &'a str,
        staged: &'a StagedObject,
        _opts: &'a WriteOptions,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let dst = self.root.resolve(key)?;
            debug!("fs publish: {:?} ({} bytes)", dst, staged.size);
            self.root.replace_with_copy(staged.path(), &dst)
        })
    }
}

/// Walks the namespace directory once, then serves it page by page.
struct LocalPages {
    root: Arc<LocalRoot>,
    prefix: String,
    page_size: usize,
    scanned: Option<Vec<ObjectEntry>>,
}

impl LocalPages {
    fn scan(&self) -> Result<Vec<ObjectEntry>> {
        let start = self.root.root.join(&self.prefix);
        if !start.is_dir() {
            // A namespace that was never written to lists as empty.
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        match walk(&self.root, &start, &mut out) {
            Ok(()) => {}
            Err(Error::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn walk(root: &LocalRoot, dir: &Path, out: &mut Vec<ObjectEntry>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            if dir == root.root.as_path() && entry.file_name() == TMP_DIR {
                continue;
            }
            match walk(root, &path, out) {
                // Removed concurrently.
                Err(Error::NotFound) => continue,
                other => other?,
            }
        } else if file_type.is_file() {
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(key) = root.key_for(&path) {
                out.push(ObjectEntry {
                    name: key,
                    size: meta.len(),
                    mod_time: meta.modified().map(DateTime::<Utc>::from)?,
                });
            }
        }
    }
    Ok(())
}

impl PageSource for LocalPages {
    fn fetch_page(&mut self, token: Option<String>) -> BoxFuture<'_, Result<Page>> {
        Box::pin(async move {
            let offset = match token {
                None => 0,
                Some(t) => t
                    .parse::<usize>()
                    .map_err(|e| Error::opaque("fs list token", e))?,
            };
            if self.scanned.is_none() {
                self.scanned = Some(self.scan()?);
            }
            let all = self.scanned.as_deref().unwrap_or_default();

            let end = (offset + self.page_size).min(all.len());
            let entries = all.get(offset..end).unwrap_or_default().to_vec();
            let next_token = (end < all.len()).then(|| end.to_string());
            Ok(Page {
                entries,
                next_token,
            })
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
