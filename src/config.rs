//! Configuration loading and types for bucketfs.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  The `storage` section selects a backend and carries
//! one optional subsection per backend.  Every backend section can also be
//! derived from a bucket URL (`from_url`), so `bucketfs::registry::connect`
//! and the YAML file share one translation target.

use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use url::Url;

use crate::errors::{Error, Result};
use crate::registry::Scheme;
use crate::storage::backend::Bucket;
use crate::storage::{aws, gcp, local, memory};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bucket backend settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Bucket backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `local`, `memory`, `aws`, `gcp` (or the URL schemes
    /// `file`, `mem`, `s3`, `gs`).
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Local filesystem configuration.
    #[serde(default)]
    pub local: LocalStorageConfig,

    /// Memory configuration.
    #[serde(default)]
    pub memory: Option<MemoryStorageConfig>,

    /// AWS S3 configuration.
    #[serde(default)]
    pub aws: Option<AwsStorageConfig>,

    /// GCP Cloud Storage configuration.
    #[serde(default)]
    pub gcp: Option<GcpStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            local: LocalStorageConfig::default(),
            memory: None,
            aws: None,
            gcp: None,
        }
    }
}

impl StorageConfig {
    /// The backend selected by `backend`.
    pub fn scheme(&self) -> Result<Scheme> {
        Scheme::from_name(&self.backend).ok_or_else(|| {
            Error::Config(format!("unknown storage backend '{}'", self.backend))
        })
    }

    /// Construct the configured bucket.
    pub async fn open(&self) -> Result<Box<dyn Bucket>> {
        match self.scheme()? {
            Scheme::File => self.local.open(),
            Scheme::Mem => Ok(self.memory.clone().unwrap_or_default().open()),
            Scheme::S3 => {
                let cfg = self.aws.as_ref().ok_or_else(|| {
                    Error::Config("storage.aws section is required for the aws backend".into())
                })?;
                cfg.open().await
            }
            Scheme::Gs => {
                let cfg = self.gcp.as_ref().ok_or_else(|| {
                    Error::Config("storage.gcp section is required for the gcp backend".into())
                })?;
                cfg.open().await
            }
        }
    }
}

/// Local filesystem configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory for stored objects.
    #[serde(default = "default_storage_root")]
    pub root_dir: String,
    /// Namespace prefix below the root.
    #[serde(default)]
    pub prefix: String,
    /// Entries per listing page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_storage_root(),
            prefix: String::new(),
            page_size: default_page_size(),
        }
    }
}

impl LocalStorageConfig {
    /// `file:///abs/path?prefix=sub&page_size=N`
    pub fn from_url(url: &Url) -> Result<Self> {
        let query = query_map(url);
        let path = decode(url.path());
        let root_dir = match url.host_str() {
            Some(host) if !host.is_empty() => format!("{host}{path}"),
            _ => path,
        };
        if root_dir.is_empty() {
            return Err(Error::Config(format!("missing root directory in '{url}'")));
        }

        Ok(Self {
            root_dir,
            prefix: query.get("prefix").cloned().unwrap_or_default(),
            page_size: parse_param(&query, "page_size")?.unwrap_or_else(default_page_size),
        })
    }

    pub fn open(&self) -> Result<Box<dyn Bucket>> {
        let bucket =
            local::LocalBucket::new(&self.root_dir, &self.prefix)?.with_page_size(self.page_size);
        Ok(Box::new(bucket))
    }
}

/// Memory configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryStorageConfig {
    /// Store name; buckets with the same name share objects.  Empty means
    /// a private store.
    #[serde(default)]
    pub name: String,
    /// Namespace prefix.
    #[serde(default)]
    pub prefix: String,
    /// Maximum total size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
    /// Entries per listing page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            prefix: String::new(),
            max_size_bytes: 0,
            page_size: default_page_size(),
        }
    }
}

impl MemoryStorageConfig {
    /// `mem://name/prefix?max_size_bytes=N&page_size=N`
    pub fn from_url(url: &Url) -> Result<Self> {
        let query = query_map(url);
        Ok(Self {
            name: url.host_str().unwrap_or_default().to_string(),
            prefix: url_prefix(url, &query),
            max_size_bytes: parse_param(&query, "max_size_bytes")?.unwrap_or(0),
            page_size: parse_param(&query, "page_size")?.unwrap_or_else(default_page_size),
        })
    }

    pub fn open(&self) -> Box<dyn Bucket> {
        let store = if self.name.is_empty() {
            memory::MemoryStore::new(self.max_size_bytes)
        } else {
            memory::MemoryStore::named(&self.name, self.max_size_bytes)
        };
        let bucket =
            memory::MemoryBucket::with_store(store, &self.prefix).with_page_size(self.page_size);
        Box::new(bucket)
    }
}

/// AWS S3 configuration.
///
/// Empty strings mean "not set".
#[derive(Debug, Clone, Deserialize)]
pub struct AwsStorageConfig {
    /// S3 bucket name.
    pub bucket: String,
    /// AWS region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Key prefix in the bucket.
    #[serde(default)]
    pub prefix: String,
    /// Custom S3-compatible endpoint (e.g. MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: String,
    /// Force path-style URL addressing.
    #[serde(default)]
    pub use_path_style: bool,
    /// Explicit AWS access key (falls back to env/credential chain).
    #[serde(default)]
    pub access_key_id: String,
    /// Explicit AWS secret key (falls back to env/credential chain).
    #[serde(default)]
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    #[serde(default)]
    pub session_token: String,
    /// Maximum number of retries per request.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Canned ACL applied to uploads and copies.
    #[serde(default)]
    pub acl: String,
    /// `x-amz-grant-full-control` applied to uploads and copies.
    #[serde(default, alias = "grant-full-control")]
    pub grant_full_control: String,
    /// Server-side encryption algorithm (e.g. `AES256`, `aws:kms`).
    #[serde(default, alias = "server_side_encryption")]
    pub sse: String,
}

impl AwsStorageConfig {
    /// Bucket-only configuration with every option defaulted.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: default_region(),
            prefix: String::new(),
            endpoint_url: String::new(),
            use_path_style: false,
            access_key_id: String::new(),
            secret_access_key: String::new(),
            session_token: String::new(),
            max_retries: None,
            acl: String::new(),
            grant_full_control: String::new(),
            sse: String::new(),
        }
    }

    /// `s3://bucket/prefix?region=..&aws_access_key_id=..&acl=..`
    pub fn from_url(url: &Url) -> Result<Self> {
        let query = query_map(url);
        let bucket = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("missing bucket name in '{url}'")))?;

        let get = |key: &str| query.get(key).cloned().unwrap_or_default();
        let mut cfg = Self::new(bucket);
        cfg.prefix = url_prefix(url, &query);
        if let Some(region) = query.get("region") {
            cfg.region = region.clone();
        }
        cfg.endpoint_url = get("endpoint");
        cfg.use_path_style = parse_param(&query, "force_path_style")?.unwrap_or(false);
        cfg.access_key_id = get("aws_access_key_id");
        cfg.secret_access_key = get("aws_secret_access_key");
        cfg.session_token = get("aws_session_token");
        cfg.max_retries = parse_param(&query, "max_retries")?;
        cfg.acl = get("acl");
        cfg.grant_full_control = query
            .get("grant_full_control")
            .or_else(|| query.get("grant-full-control"))
            .cloned()
            .unwrap_or_default();
        cfg.sse = get("sse");
        Ok(cfg)
    }

    pub async fn open(&self) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(aws::S3Bucket::new(self).await?))
    }
}

/// GCP Cloud Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GcpStorageConfig {
    /// GCS bucket name.
    pub bucket: String,
    /// Key prefix in the bucket.
    #[serde(default)]
    pub prefix: String,
    /// Path to a service account JSON file.
    #[serde(default)]
    pub credentials_file: String,
    /// OAuth2 scopes requested for the access token.
    #[serde(default = "default_gcs_scopes")]
    pub scopes: Vec<String>,
    /// Predefined ACL applied to uploads and copies (e.g. `publicRead`).
    #[serde(default)]
    pub predefined_acl: String,
    /// Custom API endpoint (e.g. a fake-gcs-server).
    #[serde(default)]
    pub endpoint_url: String,
}

impl GcpStorageConfig {
    /// Bucket-only configuration with every option defaulted.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            credentials_file: String::new(),
            scopes: default_gcs_scopes(),
            predefined_acl: String::new(),
            endpoint_url: String::new(),
        }
    }

    /// `gs://bucket/prefix?scopes=a,b&credentials=/path/key.json&acl=publicRead`
    pub fn from_url(url: &Url) -> Result<Self> {
        let query = query_map(url);
        let bucket = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config(format!("missing bucket name in '{url}'")))?;

        let mut cfg = Self::new(bucket);
        cfg.prefix = url_prefix(url, &query);
        if let Some(scopes) = query.get("scopes") {
            cfg.scopes = scopes
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        cfg.credentials_file = query.get("credentials").cloned().unwrap_or_default();
        cfg.predefined_acl = query.get("acl").cloned().unwrap_or_default();
        cfg.endpoint_url = query.get("endpoint").cloned().unwrap_or_default();
        Ok(cfg)
    }

    pub async fn open(&self) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(gcp::GcsBucket::new(self).await?))
    }
}

// -- URL helpers -------------------------------------------------------------

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs().into_owned().collect()
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Prefix from the URL path, falling back to the `prefix` query parameter.
fn url_prefix(url: &Url, query: &HashMap<String, String>) -> String {
    let path = decode(url.path());
    if path.trim_matches('/').is_empty() {
        query.get("prefix").cloned().unwrap_or_default()
    } else {
        path
    }
}

fn parse_param<T>(query: &HashMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    query
        .get(key)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| Error::Config(format!("invalid {key} '{v}': {e}")))
        })
        .transpose()
}

// -- Defaults ----------------------------------------------------------------

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_storage_backend() -> String {
    "local".to_string()
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_page_size() -> usize {
    1000
}

fn default_gcs_scopes() -> Vec<String> {
    vec!["https://www.googleapis.com/auth/devstorage.full_control".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
        assert_eq!(config.storage.backend, "local");
        assert_eq!(config.storage.local.root_dir, "./data/objects");
        assert_eq!(config.storage.local.page_size, 1000);
        assert!(matches!(config.storage.scheme(), Ok(Scheme::File)));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
logging:
  level: debug
  format: json
storage:
  backend: aws
  aws:
    bucket: my-bucket
    prefix: data/
    region: eu-west-1
    grant-full-control: id=abc
    max_retries: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.logging.format, "json");
        let aws = config.storage.aws.as_ref().unwrap();
        assert_eq!(aws.bucket, "my-bucket");
        assert_eq!(aws.region, "eu-west-1");
        assert_eq!(aws.grant_full_control, "id=abc");
        assert_eq!(aws.max_retries, Some(5));
        assert!(matches!(config.storage.scheme(), Ok(Scheme::S3)));
    }

    #[test]
    fn test_unknown_backend() {
        let config: Config = serde_yaml::from_str("storage: {backend: azure}").unwrap();
        assert!(matches!(config.storage.scheme(), Err(Error::Config(_))));
    }

    #[test]
    fn test_s3_from_url() {
        let cfg = AwsStorageConfig::from_url(&url(
            "s3://bucket/a/b?region=eu-central-1&aws_access_key_id=AK&aws_secret_access_key=SK\
             &max_retries=3&acl=private&grant-full-control=id%3D1&sse=AES256",
        ))
        .unwrap();
        assert_eq!(cfg.bucket, "bucket");
        assert_eq!(cfg.prefix, "/a/b");
        assert_eq!(cfg.region, "eu-central-1");
        assert_eq!(cfg.access_key_id, "AK");
        assert_eq!(cfg.secret_access_key, "SK");
        assert_eq!(cfg.max_retries, Some(3));
        assert_eq!(cfg.acl, "private");
        assert_eq!(cfg.grant_full_control, "id=1");
        assert_eq!(cfg.sse, "AES256");
    }

    #[test]
    fn test_prefix_query_fallback() {
        let cfg = AwsStorageConfig::from_url(&url("s3://bucket?prefix=x/y")).unwrap();
        assert_eq!(cfg.prefix, "x/y");
        let cfg = GcpStorageConfig::from_url(&url("gs://bucket/?prefix=z")).unwrap();
        assert_eq!(cfg.prefix, "z");
    }

    #[test]
    fn test_bad_params() {
        assert!(matches!(
            AwsStorageConfig::from_url(&url("s3://bucket?max_retries=many")),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            AwsStorageConfig::from_url(&url("s3:///nobucket")),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_gs_from_url() {
        let cfg = GcpStorageConfig::from_url(&url(
            "gs://bucket/pre?scopes=a,b&credentials=/tmp/key.json&acl=publicRead",
        ))
        .unwrap();
        assert_eq!(cfg.bucket, "bucket");
        assert_eq!(cfg.prefix, "/pre");
        assert_eq!(cfg.scopes, vec!["a", "b"]);
        assert_eq!(cfg.credentials_file, "/tmp/key.json");
        assert_eq!(cfg.predefined_acl, "publicRead");
    }

    #[test]
    fn test_file_and_mem_from_url() {
        let cfg = LocalStorageConfig::from_url(&url("file:///var/data?prefix=sub&page_size=10"))
            .unwrap();
        assert_eq!(cfg.root_dir, "/var/data");
        assert_eq!(cfg.prefix, "sub");
        assert_eq!(cfg.page_size, 10);

        let cfg = MemoryStorageConfig::from_url(&url("mem://store/ns")).unwrap();
        assert_eq!(cfg.name, "store");
        assert_eq!(cfg.prefix, "/ns");
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucketfs.yaml");
        std::fs::write(&path, "storage:\n  backend: memory\n  memory:\n    name: t\n").unwrap();
        let config = load_config(&path).unwrap();
        assert!(matches!(config.storage.scheme(), Ok(Scheme::Mem)));
        assert_eq!(config.storage.memory.unwrap().name, "t");
    }
}
