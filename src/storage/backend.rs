//! Abstract bucket contract.
//!
//! Every backend must implement [`Bucket`].  The trait works in terms of
//! names relative to the bucket's namespace; adapters resolve them to
//! backend keys through [`crate::namespace::Namespace`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::Result;
use crate::iter::ObjectIter;
use crate::reader::ObjectReader;
use crate::writer::Writer;

/// Boxed future returned by trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Meta information about a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetaInfo {
    /// Name relative to the bucket namespace.
    pub name: String,
    /// Length of the content in bytes.
    pub size: u64,
    /// Last modification time.
    pub mod_time: DateTime<Utc>,
    /// Content type, empty when unknown.
    pub content_type: String,
    /// User metadata with canonical MIME-header keys.
    pub metadata: HashMap<String, String>,
}

/// Optional settings applied when an object is committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Content type, or the empty string.
    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or("")
    }

    /// Metadata, or an empty map.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.metadata.clone().unwrap_or_default()
    }
}

/// Async bucket contract shared by all backends.
///
/// Implementations hold no mutable per-call state, so a single handle may be
/// shared across tasks.
pub trait Bucket: Send + Sync + 'static {
    /// List objects matching a glob pattern.
    ///
    /// The pattern is validated immediately; the listing itself is lazy and
    /// starts with the first call to [`ObjectIter::next`].
    fn glob(&self, pattern: &str) -> Result<ObjectIter>;

    /// Return an object's meta info.
    fn head(&self, name: &str) -> BoxFuture<'_, Result<MetaInfo>>;

    /// Open an object for reading.
    fn open(&self, name: &str) -> BoxFuture<'_, Result<ObjectReader>>;

    /// Create a staged writer.  Nothing becomes visible until
    /// [`Writer::commit`].
    fn create(&self, name: &str, opts: WriteOptions) -> BoxFuture<'_, Result<Writer>>;

    /// Remove an object.  Removing an absent object succeeds.
    fn remove(&self, name: &str) -> BoxFuture<'_, Result<()>>;

    /// Copy `src` to `dst` within the bucket.
    fn copy(&self, src: &str, dst: &str) -> BoxFuture<'_, Result<()>>;

    /// Release backend client resources.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Canonicalize metadata keys to MIME header form (`x-foo-bar` ->
/// `X-Foo-Bar`).
pub fn norm_metadata(meta: HashMap<String, String>) -> HashMap<String, String> {
    meta.into_iter()
        .map(|(k, v)| (canonical_header_key(&k), v))
        .collect()
}

/// Canonical MIME header form of `key`.  Keys containing characters that
/// are not valid in a header token are returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    let valid = key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
    if !valid {
        return key.to_string();
    }

    let mut upper = true;
    key.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}
