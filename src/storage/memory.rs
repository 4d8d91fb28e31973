//! In-memory bucket.
//!
//! Objects are held in a `tokio::sync::RwLock<BTreeMap<...>>` keyed by the
//! namespaced key, so listings come back in key order and can be paged by
//! "last key seen".  Buckets opened with the same store name share data for
//! the life of the process (`mem://name/prefix`).
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use super::backend::{norm_metadata, BoxFuture, Bucket, MetaInfo, WriteOptions};
use crate::errors::{Error, Result};
use crate::glob::Pattern;
use crate::iter::{ObjectEntry, ObjectIter, Page, PageSource};
use crate::metrics;
use crate::namespace::{self, Namespace};
use crate::reader::ObjectReader;
use crate::writer::{Publisher, StagedObject, Writer};

const BACKEND: &str = "mem";

/// Default number of entries per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// A stored object with its attributes.
#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    mod_time: DateTime<Utc>,
    content_type: String,
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct Contents {
    objects: BTreeMap<String, StoredObject>,
    /// Current total bytes stored.
    size: u64,
}

/// Shared object storage behind one or more [`MemoryBucket`]s.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: tokio::sync::RwLock<Contents>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
    /// Number of listing pages fetched, for observing laziness.
    list_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(max_size_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            max_size_bytes,
            ..Default::default()
        })
    }

    /// Return the process-wide store registered under `name`, creating it
    /// on first use.  `max_size_bytes` only applies to the first call.
    pub fn named(name: &str, max_size_bytes: u64) -> Arc<Self> {
        static NAMED: OnceLock<Mutex<HashMap<String, Arc<MemoryStore>>>> = OnceLock::new();
        let mut stores = NAMED
            .get_or_init(Default::default)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        stores
            .entry(name.to_string())
            .or_insert_with(|| MemoryStore::new(max_size_bytes))
            .clone()
    }

    /// Number of listing pages fetched from this store so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Total bytes currently stored.
    pub async fn size(&self) -> u64 {
        self.contents.read().await.size
    }

    /// Insert or replace `key`, enforcing the memory limit.
    async fn put(&self, key: &str, object: StoredObject) -> Result<()> {
        let mut contents = self.contents.write().await;
        let replaced = contents.objects.get(key).map_or(0, |o| o.data.len() as u64);
        let additional = object.data.len() as u64;
        let next = contents.size - replaced + additional;

        if self.max_size_bytes != 0 && next > self.max_size_bytes {
            return Err(Error::Opaque(anyhow::anyhow!(
                "Memory limit exceeded: current={}, additional={additional}, max={}",
                contents.size,
                self.max_size_bytes
            )));
        }

        contents.size = next;
        contents.objects.insert(key.to_string(), object);
        Ok(())
    }
}

/// In-memory bucket scoped to a namespace of a [`MemoryStore`].
pub struct MemoryBucket {
    store: Arc<MemoryStore>,
    namespace: Namespace,
    page_size: usize,
}

impl MemoryBucket {
    /// A bucket over a fresh, private store.
    pub fn new(prefix: &str) -> Self {
        Self::with_store(MemoryStore::new(0), prefix)
    }

    /// A bucket over an existing store.
    pub fn with_store(store: Arc<MemoryStore>, prefix: &str) -> Self {
        Self {
            store,
            namespace: Namespace::new(prefix),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set the number of entries returned per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn key(&self, name: &str) -> Option<String> {
        if namespace::clean(name).is_empty() {
            None
        } else {
            Some(self.namespace.with_prefix(name))
        }
    }
}

impl Bucket for MemoryBucket {
    fn glob(&self, pattern: &str) -> Result<ObjectIter> {
        let pattern = Pattern::new(pattern)?;
        let source = MemoryPages {
            store: self.store.clone(),
            prefix: self.namespace.prefix().to_string(),
            page_size: self.page_size,
        };
        Ok(ObjectIter::new(source, self.namespace.clone(), pattern))
    }

    fn head(&self, name: &str) -> BoxFuture<'_, Result<MetaInfo>> {
        let name = namespace::clean(name);
        metrics::observe(BACKEND, "head", async move {
            let key = self.key(&name).ok_or(Error::NotFound)?;
            let contents = self.store.contents.read().await;
            let object = contents.objects.get(&key).ok_or(Error::NotFound)?;
            Ok(MetaInfo {
                name,
                size: object.data.len() as u64,
                mod_time: object.mod_time,
                content_type: object.content_type.clone(),
                metadata: object.metadata.clone(),
            })
        })
        .boxed()
    }

    fn open(&self, name: &str) -> BoxFuture<'_, Result<ObjectReader>> {
        let name = name.to_string();
        metrics::observe(BACKEND, "open", async move {
            let key = self.key(&name).ok_or(Error::NotFound)?;
            let data = {
                let contents = self.store.contents.read().await;
                contents
                    .objects
                    .get(&key)
                    .map(|o| o.data.clone())
                    .ok_or(Error::NotFound)?
            };
            let len = data.len() as u64;
            Ok(ObjectReader::new(std::io::Cursor::new(data), len))
        })
        .boxed()
    }

    fn create(&self, name: &str, opts: WriteOptions) -> BoxFuture<'_, Result<Writer>> {
        let name = name.to_string();
        Box::pin(async move {
            let key = self
                .key(&name)
                .ok_or_else(|| Error::InvalidName(name.clone()))?;
            let publisher: Arc<dyn Publisher> = Arc::new(MemoryPublisher {
                store: self.store.clone(),
            });
            Writer::new(name, key, opts, publisher)
        })
    }

    fn remove(&self, name: &str) -> BoxFuture<'_, Result<()>> {
        let name = name.to_string();
        metrics::observe(BACKEND, "remove", async move {
            let Some(key) = self.key(&name) else {
                return Ok(());
            };
            let mut contents = self.store.contents.write().await;
            if let Some(old) = contents.objects.remove(&key) {
                contents.size = contents.size.saturating_sub(old.data.len() as u64);
            }
            Ok(())
        })
        .boxed()
    }

    fn copy(&self, src: &str, dst: &str) -> BoxFuture<'_, Result<()>> {
        let src = src.to_string();
        let dst = dst.to_string();
        metrics::observe(BACKEND, "copy", async move {
            let src_key = self.key(&src).ok_or(Error::NotFound)?;
            let dst_key = self
                .key(&dst)
                .ok_or_else(|| Error::InvalidName(dst.clone()))?;

            let mut object = {
                let contents = self.store.contents.read().await;
                contents
                    .objects
                    .get(&src_key)
                    .cloned()
                    .ok_or(Error::NotFound)?
            };
            object.mod_time = Utc::now();
            self.store.put(&dst_key, object).await
        })
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

struct MemoryPublisher {
    store: Arc<MemoryStore>,
}

impl Publisher for MemoryPublisher {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn publish<'a>(
        &'a self,
        key: &'a str,
        staged: &'a StagedObject,
        opts: &'a WriteOptions,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let data = Bytes::from(tokio::fs::read(staged.path()).await?);
            let object = StoredObject {
                data,
                mod_time: Utc::now(),
                content_type: opts.content_type().to_string(),
                metadata: norm_metadata(opts.metadata()),
            };
            self.store.put(key, object).await
        })
    }
}

/// Pages over keys under a prefix; the token is the last key returned.
struct MemoryPages {
    store: Arc<MemoryStore>,
    prefix: String,
    page_size: usize,
}

impl PageSource for MemoryPages {
    fn fetch_page(&mut self, token: Option<String>) -> BoxFuture<'_, Result<Page>> {
        Box::pin(async move {
            self.store.list_calls.fetch_add(1, Ordering::SeqCst);

            let contents = self.store.contents.read().await;
            let start = match token {
                Some(last) => Bound::Excluded(last),
                None => Bound::Included(self.prefix.clone()),
            };

            let mut matching = contents
                .objects
                .range((start, Bound::Unbounded))
                .take_while(|(key, _)| key.starts_with(&self.prefix));

            let entries: Vec<ObjectEntry> = matching
                .by_ref()
                .take(self.page_size)
                .map(|(key, object)| ObjectEntry {
                    name: key.clone(),
                    size: object.data.len() as u64,
                    mod_time: object.mod_time,
                })
                .collect();

            let more = matching.next().is_some();
            let next_token = if more {
                entries.last().map(|e| e.name.clone())
            } else {
                None
            };
            Ok(Page {
                entries,
                next_token,
            })
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────
