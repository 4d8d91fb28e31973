//! Scheme registry: maps URL schemes to bucket constructors.
//!
//! The built-in schemes ([`Scheme`]) are registered when the registry is
//! first touched.  Further schemes can be added with [`register`]; a scheme
//! can only be registered once per process.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::debug;
use url::Url;

use crate::config::{AwsStorageConfig, GcpStorageConfig, LocalStorageConfig, MemoryStorageConfig};
use crate::errors::{Error, Result};
use crate::storage::backend::{BoxFuture, Bucket};

/// Constructor invoked for URLs of a registered scheme.
pub type Resolver = Arc<dyn Fn(Url) -> BoxFuture<'static, Result<Box<dyn Bucket>>> + Send + Sync>;

/// Built-in bucket schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Local filesystem (`file://`).
    File,
    /// Process-local memory (`mem://`).
    Mem,
    /// AWS S3 (`s3://`).
    S3,
    /// Google Cloud Storage (`gs://`).
    Gs,
}

impl Scheme {
    pub const ALL: [Scheme; 4] = [Scheme::File, Scheme::Mem, Scheme::S3, Scheme::Gs];

    /// URL scheme string.
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Mem => "mem",
            Scheme::S3 => "s3",
            Scheme::Gs => "gs",
        }
    }

    /// Parse a URL scheme or a config backend name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "file" | "local" | "fs" => Some(Scheme::File),
            "mem" | "memory" => Some(Scheme::Mem),
            "s3" | "aws" => Some(Scheme::S3),
            "gs" | "gcs" | "gcp" => Some(Scheme::Gs),
            _ => None,
        }
    }

    /// Build a bucket of this kind from `url`.
    pub async fn open(self, url: &Url) -> Result<Box<dyn Bucket>> {
        match self {
            Scheme::File => LocalStorageConfig::from_url(url)?.open(),
            Scheme::Mem => Ok(MemoryStorageConfig::from_url(url)?.open()),
            Scheme::S3 => AwsStorageConfig::from_url(url)?.open().await,
            Scheme::Gs => GcpStorageConfig::from_url(url)?.open().await,
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn registry() -> &'static Mutex<HashMap<String, Resolver>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Resolver>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, Resolver> = HashMap::new();
        for scheme in Scheme::ALL {
            let resolver: Resolver = Arc::new(move |url: Url| {
                Box::pin(async move { scheme.open(&url).await })
                    as BoxFuture<'static, Result<Box<dyn Bucket>>>
            });
            map.insert(scheme.as_str().to_string(), resolver);
        }
        Mutex::new(map)
    })
}

/// Register a constructor for `scheme`.
///
/// # Panics
///
/// Panics if `scheme` is already registered, including the built-ins.
pub fn register<F, Fut>(scheme: &str, resolver: F)
where
    F: Fn(Url) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<dyn Bucket>>> + Send + 'static,
{
    let scheme = scheme.to_ascii_lowercase();
    let mut map = registry().lock().unwrap_or_else(PoisonError::into_inner);
    if map.contains_key(&scheme) {
        // Release the lock first so the registry stays usable after the panic.
        drop(map);
        panic!("bucketfs: scheme {scheme:?} is already registered");
    }

    let resolver: Resolver = Arc::new(move |url: Url| {
        Box::pin(resolver(url)) as BoxFuture<'static, Result<Box<dyn Bucket>>>
    });
    map.insert(scheme, resolver);
}

/// Whether a constructor is registered for `scheme`.
pub fn is_registered(scheme: &str) -> bool {
    registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(&scheme.to_ascii_lowercase())
}

/// Construct a bucket for `url` using the constructor registered for its
/// scheme.
pub async fn resolve(url: &Url) -> Result<Box<dyn Bucket>> {
    let resolver = registry()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(url.scheme())
        .cloned()
        .ok_or_else(|| Error::UnknownScheme(url.scheme().to_string()))?;

    debug!("resolving bucket: scheme={} url={}", url.scheme(), url);
    resolver(url.clone()).await
}

/// Parse `url` and [`resolve`] it.
pub async fn connect(url: &str) -> Result<Box<dyn Bucket>> {
    let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid URL '{url}': {e}")))?;
    resolve(&url).await
}
