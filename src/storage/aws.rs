//! AWS S3 bucket.
//!
//! Objects live under `{prefix}{name}` in a single S3 bucket.  Uploads go
//! through a staged temp file and a single `PutObject` carrying the
//! `Content-MD5` of the staged bytes; listings page through
//! `ListObjectsV2` continuation tokens.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless configured
//! explicitly.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, ServerSideEncryption};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::{norm_metadata, BoxFuture, Bucket, MetaInfo, WriteOptions};
use crate::config::AwsStorageConfig;
use crate::errors::{Error, Result};
use crate::glob::Pattern;
use crate::iter::{ObjectEntry, ObjectIter, Page, PageSource};
use crate::metrics;
use crate::namespace::{self, Namespace};
use crate::reader::ObjectReader;
use crate::writer::{Publisher, StagedObject, Writer};

const BACKEND: &str = "s3";

/// ACL applied when neither `acl` nor `grant_full_control` is configured.
pub const DEFAULT_ACL: &str = "bucket-owner-full-control";

/// Characters escaped in the `x-amz-copy-source` header.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Client plus the per-upload settings shared with writers.
struct S3Inner {
    client: Client,
    bucket: String,
    acl: Option<String>,
    grant_full_control: Option<String>,
    sse: Option<String>,
}

/// Bucket backed by AWS S3 (or an S3-compatible endpoint).
pub struct S3Bucket {
    inner: Arc<S3Inner>,
    namespace: Namespace,
}

impl S3Bucket {
    /// Connect to the bucket described by `cfg`.
    pub async fn new(cfg: &AwsStorageConfig) -> Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(cfg.region.clone()));

        if !cfg.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&cfg.endpoint_url);
        }

        // If explicit credentials are provided, inject them as static credentials.
        if !cfg.access_key_id.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &cfg.access_key_id,
                &cfg.secret_access_key,
                non_empty(&cfg.session_token),
                None, // expiry
                "bucketfs-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        if let Some(retries) = cfg.max_retries {
            config_loader = config_loader.retry_config(
                aws_config::retry::RetryConfig::standard().with_max_attempts(retries + 1),
            );
        }

        let sdk_config = config_loader.load().await;
        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(cfg.use_path_style);
        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self::with_client(client, cfg))
    }

    /// Wrap an existing client.
    pub fn with_client(client: Client, cfg: &AwsStorageConfig) -> Self {
        let namespace = Namespace::new(&cfg.prefix);
        info!(
            "S3 bucket initialized: bucket={} prefix='{}'",
            cfg.bucket,
            namespace.prefix()
        );

        let (acl, grant_full_control) = upload_grants(cfg);
        Self {
            inner: Arc::new(S3Inner {
                client,
                bucket: cfg.bucket.clone(),
                acl,
                grant_full_control,
                sse: non_empty(&cfg.sse),
            }),
            namespace,
        }
    }

    fn key(&self, name: &str) -> Option<String> {
        if namespace::clean(name).is_empty() {
            None
        } else {
            Some(self.namespace.with_prefix(name))
        }
    }
}

impl Bucket for S3Bucket {
    fn glob(&self, pattern: &str) -> Result<ObjectIter> {
        let pattern = Pattern::new(pattern)?;
        let source = S3Pages {
            client: self.inner.client.clone(),
            bucket: self.inner.bucket.clone(),
            prefix: self.namespace.prefix().to_string(),
        };
        Ok(ObjectIter::new(source, self.namespace.clone(), pattern))
    }

    fn head(&self, name: &str) -> BoxFuture<'_, Result<MetaInfo>> {
        let name = namespace::clean(name);
        metrics::observe(BACKEND, "head", async move {
            let key = self.key(&name).ok_or(Error::NotFound)?;
            debug!("S3 head_object: bucket={} key={}", self.inner.bucket, key);

            let resp = self
                .inner
                .client
                .head_object()
                .bucket(&self.inner.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| normalize_sdk_error("head_object", e))?;

            Ok(MetaInfo {
                name,
                size: resp.content_length().unwrap_or(0).max(0) as u64,
                mod_time: resp.last_modified().map(to_chrono).unwrap_or_default(),
                content_type: resp.content_type().unwrap_or_default().to_string(),
                metadata: norm_metadata(resp.metadata().cloned().unwrap_or_default()),
            })
        })
        .boxed()
    }

    fn open(&self, name: &str) -> BoxFuture<'_, Result<ObjectReader>> {
        let name = name.to_string();
        metrics::observe(BACKEND, "open", async move {
            let key = self.key(&name).ok_or(Error::NotFound)?;
            debug!("S3 get_object: bucket={} key={}", self.inner.bucket, key);

            let resp = self
                .inner
                .client
                .get_object()
                .bucket(&self.inner.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| normalize_sdk_error("get_object", e))?;

            let len = resp.content_length().unwrap_or(0).max(0) as u64;
            Ok(ObjectReader::new(resp.body.into_async_read(), len))
        })
        .boxed()
    }

    fn create(&self, name: &str, opts: WriteOptions) -> BoxFuture<'_, Result<Writer>> {
        let name = name.to_string();
        Box::pin(async move {
            let key = self
                .key(&name)
                .ok_or_else(|| Error::InvalidName(name.clone()))?;
            let publisher: Arc<dyn Publisher> = self.inner.clone();
            Writer::new(name, key, opts, publisher)
        })
    }

    fn remove(&self, name: &str) -> BoxFuture<'_, Result<()>> {
        let name = name.to_string();
        metrics::observe(BACKEND, "remove", async move {
            let Some(key) = self.key(&name) else {
                return Ok(());
            };
            debug!("S3 delete_object: bucket={} key={}", self.inner.bucket, key);

            // S3 delete_object is idempotent -- no error for missing keys.
            match self
                .inner
                .client
                .delete_object()
                .bucket(&self.inner.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| normalize_sdk_error("delete_object", e))
            {
                Ok(_) | Err(Error::NotFound) => Ok(()),
                Err(e) => Err(e),
            }
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

            // Use S3 server-side copy.
            let copy_source = copy_source(&self.inner.bucket, &src_key);
            debug!(
                "S3 copy_object: src={} dst={}/{}",
                copy_source, self.inner.bucket, dst_key
            );

            self.inner
                .client
                .copy_object()
                .bucket(&self.inner.bucket)
                .key(&dst_key)
                .copy_source(copy_source)
                .set_acl(self.inner.acl.as_deref().map(ObjectCannedAcl::from))
                .set_grant_full_control(self.inner.grant_full_control.clone())
                .set_server_side_encryption(
                    self.inner.sse.as_deref().map(ServerSideEncryption::from),
                )
                .send()
                .await
                .map_err(|e| normalize_sdk_error("copy_object", e))?;
            Ok(())
        })
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl Publisher for S3Inner {
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
            debug!(
                "S3 put_object: bucket={} key={} size={}",
                self.bucket, key, staged.size
            );

            let body = ByteStream::from_path(staged.path())
                .await
                .map_err(|e| Error::opaque("S3 put_object body", e))?;

            let metadata = opts.metadata();
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(body)
                .content_length(staged.size as i64)
                .content_md5(staged.content_md5())
                .set_content_type(non_empty(opts.content_type()))
                .set_metadata((!metadata.is_empty()).then_some(metadata))
                .set_acl(self.acl.as_deref().map(ObjectCannedAcl::from))
                .set_grant_full_control(self.grant_full_control.clone())
                .set_server_side_encryption(self.sse.as_deref().map(ServerSideEncryption::from))
                .send()
                .await
                .map_err(|e| normalize_sdk_error("put_object", e))?;
            Ok(())
        })
    }
}

/// `ListObjectsV2` pager.
struct S3Pages {
    client: Client,
    bucket: String,
    prefix: String,
}

impl PageSource for S3Pages {
    fn fetch_page(&mut self, token: Option<String>) -> BoxFuture<'_, Result<Page>> {
        Box::pin(async move {
            debug!(
                "S3 list_objects_v2: bucket={} prefix='{}' continuation={}",
                self.bucket,
                self.prefix,
                token.is_some()
            );

            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(token)
                .send()
                .await
                .map_err(|e| normalize_sdk_error("list_objects_v2", e))?;

            let entries = resp
                .contents()
                .iter()
                .filter_map(|obj| {
                    Some(ObjectEntry {
                        name: obj.key()?.to_string(),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        mod_time: obj.last_modified().map(to_chrono).unwrap_or_default(),
                    })
                })
                .collect();

            Ok(Page {
                entries,
                next_token: resp.next_continuation_token().map(String::from),
            })
        })
    }
}

// -- Helpers -----------------------------------------------------------------

/// Map an SDK error into the shared taxonomy.
fn normalize_sdk_error<E>(context: &str, err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::TimeoutError(_) => return Error::Canceled,
        SdkError::DispatchFailure(failure) if failure.is_timeout() => return Error::Canceled,
        _ => {}
    }

    if let Some(raw) = err.raw_response() {
        if raw.status().as_u16() == 404 {
            return Error::NotFound;
        }
    }

    match err.code() {
        Some("NoSuchKey") | Some("NotFound") => Error::NotFound,
        Some("RequestCanceled") => Error::Canceled,
        _ => Error::opaque(&format!("S3 {context}"), DisplayErrorContext(&err)),
    }
}

/// Resolve the effective `(acl, grant_full_control)` pair.
fn upload_grants(cfg: &AwsStorageConfig) -> (Option<String>, Option<String>) {
    let grant = non_empty(&cfg.grant_full_control);
    let acl = match non_empty(&cfg.acl) {
        Some(acl) => Some(acl),
        None if grant.is_none() => Some(DEFAULT_ACL.to_string()),
        None => None,
    };
    (acl, grant)
}

fn copy_source(bucket: &str, key: &str) -> String {
    utf8_percent_encode(&format!("{bucket}/{key}"), COPY_SOURCE).to_string()
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()).unwrap_or_default()
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::error::ErrorMetadata;
    use aws_sdk_s3::operation::head_object::HeadObjectError;
    use aws_smithy_runtime_api::http::StatusCode;
    use aws_smithy_types::body::SdkBody;

    fn service_error(status: u16, code: &str) -> SdkError<HeadObjectError, HttpResponse> {
        let raw = HttpResponse::new(StatusCode::try_from(status).unwrap(), SdkBody::empty());
        let err = HeadObjectError::generic(ErrorMetadata::builder().code(code).build());
        SdkError::service_error(err, raw)
    }

    #[test]
    fn test_normalize_not_found_by_status() {
        let err = normalize_sdk_error("head_object", service_error(404, "Whatever"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_normalize_by_code() {
        let err = normalize_sdk_error("get_object", service_error(400, "NoSuchKey"));
        assert!(err.is_not_found());
        let err = normalize_sdk_error("get_object", service_error(400, "RequestCanceled"));
        assert!(err.is_canceled());
        let err = normalize_sdk_error("get_object", service_error(403, "AccessDenied"));
        assert!(matches!(err, Error::Opaque(_)));
        assert!(err.to_string().contains("get_object"));
    }

    #[test]
    fn test_normalize_timeout() {
        let err: SdkError<HeadObjectError, HttpResponse> =
            SdkError::timeout_error("deadline elapsed");
        assert!(normalize_sdk_error("head_object", err).is_canceled());
    }

    #[test]
    fn test_default_acl() {
        let cfg = AwsStorageConfig::new("b");
        assert_eq!(upload_grants(&cfg), (Some(DEFAULT_ACL.to_string()), None));

        let mut cfg = AwsStorageConfig::new("b");
        cfg.grant_full_control = "id=abc".to_string();
        assert_eq!(upload_grants(&cfg), (None, Some("id=abc".to_string())));

        let mut cfg = AwsStorageConfig::new("b");
        cfg.acl = "private".to_string();
        assert_eq!(upload_grants(&cfg), (Some("private".to_string()), None));
    }

    #[test]
    fn test_copy_source_escaping() {
        assert_eq!(copy_source("bkt", "a/b c.txt"), "bkt/a/b%20c.txt");
        assert_eq!(copy_source("bkt", "x+y"), "bkt/x%2By");
    }

    #[test]
    fn test_to_chrono() {
        let dt = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        assert_eq!(to_chrono(&dt).timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_invalid_pattern_needs_no_connection() {
        let conf = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        let bucket = S3Bucket::with_client(Client::from_conf(conf), &AwsStorageConfig::new("b"));
        assert!(matches!(
            bucket.glob("a/[").unwrap_err(),
            Error::InvalidPattern { .. }
        ));
        assert!(bucket.glob("a/*").is_ok());
    }
}
