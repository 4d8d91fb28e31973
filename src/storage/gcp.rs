//! GCP Cloud Storage bucket.
//!
//! Talks to the GCS JSON API using `reqwest`.  Objects live under
//! `{prefix}{name}` in a single GCS bucket.  Uploads are a single
//! `uploadType=multipart` request streamed from the staged file, carrying
//! the object metadata and its `md5Hash` so the service verifies integrity.
//!
//! Credentials are resolved in order:
//!   - `credentials_file` from the config (service account or user JSON)
//!   - `GOOGLE_APPLICATION_CREDENTIALS` environment variable
//!   - gcloud CLI auth (`gcloud auth application-default login`)
//!   - GCE metadata server (when running on Google Cloud)
//!
//! With a custom `endpoint_url` and no credentials file, requests are sent
//! unauthenticated (for emulators such as fake-gcs-server).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::backend::{norm_metadata, BoxFuture, Bucket, MetaInfo, WriteOptions};
use crate::config::GcpStorageConfig;
use crate::errors::{normalize_http, Error, Result};
use crate::glob::Pattern;
use crate::iter::{ObjectEntry, ObjectIter, Page, PageSource};
use crate::metrics;
use crate::namespace::{self, Namespace};
use crate::reader::{ObjectReader, UNKNOWN_LENGTH};
use crate::writer::{Publisher, StagedObject, Writer};

const BACKEND: &str = "gs";

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// Default OAuth2 token endpoint.
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Fields requested from list calls.
const LIST_FIELDS: &str = "items(name,size,updated),nextPageToken";

// -- GCS JSON API types --------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: Option<String>,
    /// Decimal string, as GCS encodes uint64.
    size: Option<String>,
    updated: Option<String>,
    content_type: Option<String>,
    metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsListResponse {
    items: Option<Vec<GcsObject>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsRewriteResponse {
    #[serde(default)]
    done: bool,
    rewrite_token: Option<String>,
}

/// Object resource sent as the first part of a multipart upload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResource<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
    md5_hash: String,
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

// -- Token management ---------------------------------------------------------

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// HTTP client, credentials and upload settings shared with writers.
struct GcsClient {
    http: reqwest::Client,
    base: String,
    bucket: String,
    credentials_file: Option<String>,
    scopes: Vec<String>,
    predefined_acl: Option<String>,
    anonymous: bool,
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcsClient {
    /// Get an OAuth2 access token, reusing the cached one until 60s before
    /// it expires.
    async fn access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self
                .token_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(ref cached) = *cache {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_access_token().await?;
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));

        let mut cache = self
            .token_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *cache = Some(CachedToken {
            access_token: token.clone(),
            expiry,
        });
        Ok(token)
    }

    /// Fetch a fresh access token from the credential source.
    async fn fetch_access_token(&self) -> anyhow::Result<(String, u64)> {
        if let Some(ref path) = self.credentials_file {
            return self.token_from_file(path).await;
        }

        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return self.token_from_file(&path).await;
        }

        let adc_path = application_default_credentials_path();
        if let Ok(true) = tokio::fs::try_exists(&adc_path).await {
            return self.token_from_file(&adc_path).await;
        }

        self.token_from_metadata_server().await
    }

    /// Obtain an access token from a service account or user credentials
    /// JSON file.
    async fn token_from_file(&self, path: &str) -> anyhow::Result<(String, u64)> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read credentials file {path}: {e}"))?;
        let creds: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse credentials file {path}: {e}"))?;

        let field = |name: &str| creds.get(name).and_then(|v| v.as_str()).unwrap_or("");

        match field("type") {
            "service_account" => {
                let token_uri = match field("token_uri") {
                    "" => GOOGLE_TOKEN_URI,
                    uri => uri,
                };
                self.token_from_jwt(field("client_email"), field("private_key"), token_uri)
                    .await
            }
            "authorized_user" => {
                self.token_from_refresh(
                    field("client_id"),
                    field("client_secret"),
                    field("refresh_token"),
                )
                .await
            }
            other => Err(anyhow::anyhow!(
                "Unsupported credential type in {path}: {other}"
            )),
        }
    }

    /// Exchange a signed JWT assertion for an access token (service account
    /// flow).
    async fn token_from_jwt(
        &self,
        client_email: &str,
        private_key_pem: &str,
        token_uri: &str,
    ) -> anyhow::Result<(String, u64)> {
        if client_email.is_empty() || private_key_pem.is_empty() {
            anyhow::bail!("Missing client_email or private_key in service account key");
        }

        let assertion = sign_jwt(client_email, private_key_pem, token_uri, &self.scopes)?;
        let resp = self
            .http
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token exchange request failed: {e}"))?;
        parse_token_response("Token exchange", resp).await
    }

    /// Exchange a refresh token for an access token.
    async fn token_from_refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> anyhow::Result<(String, u64)> {
        let resp = self
            .http
            .post(GOOGLE_TOKEN_URI)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Token refresh request failed: {e}"))?;
        parse_token_response("Token refresh", resp).await
    }

    /// Obtain an access token from the GCE metadata server.
    async fn token_from_metadata_server(&self) -> anyhow::Result<(String, u64)> {
        let resp = self
            .http
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .query(&[("scopes", self.scopes.join(","))])
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Metadata server request failed: {e}. Set credentials_file, \
                     GOOGLE_APPLICATION_CREDENTIALS, or run 'gcloud auth application-default login'."
                )
            })?;
        parse_token_response("Metadata server", resp).await
    }

    /// Start a request with the authorization header attached.
    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        let req = self.http.request(method, url);
        if self.anonymous {
            return Ok(req);
        }
        let token = self.access_token().await?;
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| anyhow::anyhow!("Invalid auth header value: {e}"))?;
        Ok(req.header(AUTHORIZATION, value))
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base,
            url_encode(&self.bucket),
            url_encode(key)
        )
    }

    fn list_url(&self) -> String {
        format!("{}/storage/v1/b/{}/o", self.base, url_encode(&self.bucket))
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base,
            url_encode(&self.bucket)
        )
    }

    fn rewrite_url(&self, src: &str, dst: &str) -> String {
        let bucket = url_encode(&self.bucket);
        format!(
            "{}/storage/v1/b/{bucket}/o/{}/rewriteTo/b/{bucket}/o/{}",
            self.base,
            url_encode(src),
            url_encode(dst)
        )
    }
}

/// Bucket backed by Google Cloud Storage.
pub struct GcsBucket {
    inner: Arc<GcsClient>,
    namespace: Namespace,
}

impl GcsBucket {
    /// Create a bucket handle.  Credentials are resolved lazily on the first
    /// API call.
    pub async fn new(cfg: &GcpStorageConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::opaque("Failed to create HTTP client", e))?;

        let base = match cfg.endpoint_url.trim_end_matches('/') {
            "" => GCS_API_BASE.to_string(),
            endpoint => endpoint.to_string(),
        };
        let credentials_file = (!cfg.credentials_file.is_empty()).then(|| cfg.credentials_file.clone());
        let anonymous = !cfg.endpoint_url.is_empty() && credentials_file.is_none();

        let namespace = Namespace::new(&cfg.prefix);
        info!(
            "GCS bucket initialized: bucket={} prefix='{}' endpoint={}",
            cfg.bucket,
            namespace.prefix(),
            base
        );

        Ok(Self {
            inner: Arc::new(GcsClient {
                http,
                base,
                bucket: cfg.bucket.clone(),
                credentials_file,
                scopes: cfg.scopes.clone(),
                predefined_acl: (!cfg.predefined_acl.is_empty()).then(|| cfg.predefined_acl.clone()),
                anonymous,
                token_cache: Mutex::new(None),
            }),
            namespace,
        })
    }

    fn key(&self, name: &str) -> Option<String> {
        if namespace::clean(name).is_empty() {
            None
        } else {
            Some(self.namespace.with_prefix(name))
        }
    }
}

impl Bucket for GcsBucket {
    fn glob(&self, pattern: &str) -> Result<ObjectIter> {
        let pattern = Pattern::new(pattern)?;
        let source = GcsPages {
            client: self.inner.clone(),
            prefix: self.namespace.prefix().to_string(),
        };
        Ok(ObjectIter::new(source, self.namespace.clone(), pattern))
    }

    fn head(&self, name: &str) -> BoxFuture<'_, Result<MetaInfo>> {
        let name = namespace::clean(name);
        metrics::observe(BACKEND, "head", async move {
            let key = self.key(&name).ok_or(Error::NotFound)?;
            debug!("GCS get metadata: bucket={} key={}", self.inner.bucket, key);

            let resp = self
                .inner
                .request(reqwest::Method::GET, &self.inner.object_url(&key))
                .await?
                .send()
                .await
                .map_err(|e| normalize_http("GCS head", e))?;
            let resp = check_response("head", resp).await?;
            let obj: GcsObject = resp
                .json()
                .await
                .map_err(|e| normalize_http("GCS head body", e))?;

            meta_info(name, obj)
        })
        .boxed()
    }

    fn open(&self, name: &str) -> BoxFuture<'_, Result<ObjectReader>> {
        let name = name.to_string();
        metrics::observe(BACKEND, "open", async move {
            let key = self.key(&name).ok_or(Error::NotFound)?;
            debug!("GCS download: bucket={} key={}", self.inner.bucket, key);

            let resp = self
                .inner
                .request(reqwest::Method::GET, &self.inner.object_url(&key))
                .await?
                .query(&[("alt", "media")])
                .send()
                .await
                .map_err(|e| normalize_http("GCS download", e))?;
            let resp = check_response("download", resp).await?;

            // Without a length (transcoded responses) read until EOF.
            let len = resp
                .content_length()
                .or_else(|| {
                    resp.headers()
                        .get("x-goog-stored-content-length")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(UNKNOWN_LENGTH);

            let stream = resp.bytes_stream().map_err(std::io::Error::other);
            Ok(ObjectReader::new(
                tokio_util::io::StreamReader::new(stream),
                len,
            ))
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
            debug!("GCS delete: bucket={} key={}", self.inner.bucket, key);

            let resp = self
                .inner
                .request(reqwest::Method::DELETE, &self.inner.object_url(&key))
                .await?
                .send()
                .await
                .map_err(|e| normalize_http("GCS delete", e))?;

            // Idempotent (ignores 404).
            match check_response("delete", resp).await {
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
            debug!(
                "GCS rewrite: bucket={} src={} dst={}",
                self.inner.bucket, src_key, dst_key
            );

            let url = self.inner.rewrite_url(&src_key, &dst_key);

            // Rewrite may require multiple calls for large objects.
            let mut rewrite_token: Option<String> = None;
            loop {
                let mut req = self.inner.request(reqwest::Method::POST, &url).await?;
                if let Some(ref token) = rewrite_token {
                    req = req.query(&[("rewriteToken", token.as_str())]);
                }
                if let Some(ref acl) = self.inner.predefined_acl {
                    req = req.query(&[("destinationPredefinedAcl", acl.as_str())]);
                }

                // Empty JSON body required for rewrite.
                let resp = req
                    .header(CONTENT_TYPE, "application/json")
                    .body("{}")
                    .send()
                    .await
                    .map_err(|e| normalize_http("GCS rewrite", e))?;
                let resp = check_response("rewrite", resp).await?;
                let body: GcsRewriteResponse = resp
                    .json()
                    .await
                    .map_err(|e| normalize_http("GCS rewrite body", e))?;

                if body.done {
                    return Ok(());
                }
                match body.rewrite_token {
                    Some(token) => rewrite_token = Some(token),
                    None => {
                        return Err(Error::opaque(
                            "GCS rewrite",
                            "incomplete rewrite without a continuation token",
                        ))
                    }
                }
            }
        })
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl Publisher for GcsClient {
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
                "GCS multipart upload: bucket={} key={} size={}",
                self.bucket, key, staged.size
            );

            let resource = UploadResource {
                name: key,
                content_type: (!opts.content_type().is_empty()).then(|| opts.content_type()),
                metadata: opts.metadata(),
                md5_hash: staged.content_md5(),
            };
            let boundary = format!("bucketfs-{}", uuid::Uuid::new_v4().simple());
            let (head, tail) = multipart_frame(&boundary, &resource, opts.content_type())?;
            let total = head.len() as u64 + staged.size + tail.len() as u64;

            let file = tokio::fs::File::open(staged.path()).await?;
            let body = futures::stream::once(async move { Ok::<_, std::io::Error>(head) })
                .chain(tokio_util::io::ReaderStream::new(file))
                .chain(futures::stream::once(async move { Ok(tail) }));

            let mut req = self
                .request(reqwest::Method::POST, &self.upload_url())
                .await?
                .query(&[("uploadType", "multipart")]);
            if let Some(ref acl) = self.predefined_acl {
                req = req.query(&[("predefinedAcl", acl.as_str())]);
            }

            let resp = req
                .header(
                    CONTENT_TYPE,
                    format!("multipart/related; boundary={boundary}"),
                )
                .header(CONTENT_LENGTH, total)
                .body(reqwest::Body::wrap_stream(body))
                .send()
                .await
                .map_err(|e| normalize_http("GCS upload", e))?;
            check_response("upload", resp).await?;
            Ok(())
        })
    }
}

/// `objects.list` pager.
struct GcsPages {
    client: Arc<GcsClient>,
    prefix: String,
}

impl PageSource for GcsPages {
    fn fetch_page(&mut self, token: Option<String>) -> BoxFuture<'_, Result<Page>> {
        Box::pin(async move {
            debug!(
                "GCS list: bucket={} prefix='{}' continuation={}",
                self.client.bucket,
                self.prefix,
                token.is_some()
            );

            let mut req = self
                .client
                .request(reqwest::Method::GET, &self.client.list_url())
                .await?
                .query(&[("prefix", self.prefix.as_str()), ("fields", LIST_FIELDS)]);
            if let Some(ref token) = token {
                req = req.query(&[("pageToken", token.as_str())]);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| normalize_http("GCS list", e))?;
            let resp = check_response("list", resp).await?;
            let list: GcsListResponse = resp
                .json()
                .await
                .map_err(|e| normalize_http("GCS list body", e))?;

            let entries = list_entries(list.items.unwrap_or_default())?;

            Ok(Page {
                entries,
                next_token: list.next_page_token.filter(|t| !t.is_empty()),
            })
        })
    }
}

// -- Helpers -----------------------------------------------------------------

/// Get the path to gcloud application-default credentials.
fn application_default_credentials_path() -> String {
    if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
        return format!("{config_dir}/application_default_credentials.json");
    }
    if let Ok(home) = std::env::var("HOME") {
        return format!("{home}/.config/gcloud/application_default_credentials.json");
    }
    ".config/gcloud/application_default_credentials.json".to_string()
}

/// Build an RS256-signed JWT assertion for the token endpoint.
fn sign_jwt(
    client_email: &str,
    private_key_pem: &str,
    token_uri: &str,
    scopes: &[String],
) -> anyhow::Result<String> {
    let now = Utc::now().timestamp();
    let claims = JwtClaims {
        iss: client_email,
        scope: scopes.join(" "),
        aud: token_uri,
        iat: now,
        exp: now + 3600,
    };
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid service account private key: {e}"))?;
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
        &claims,
        &key,
    )
    .map_err(|e| anyhow::anyhow!("Failed to sign JWT: {e}"))
}

/// Extract `(access_token, expires_in)` from an OAuth2 token response.
async fn parse_token_response(
    context: &str,
    resp: reqwest::Response,
) -> anyhow::Result<(String, u64)> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("{context} failed ({status}): {body}");
    }

    let token_resp: serde_json::Value = resp.json().await?;
    let access_token = token_resp
        .get("access_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("No access_token in {context} response"))?
        .to_string();
    let expires_in = token_resp
        .get("expires_in")
        .and_then(|v| v.as_u64())
        .unwrap_or(3600);
    Ok((access_token, expires_in))
}

/// Pass successful responses through; map 404 to `NotFound` and anything
/// else to an opaque error carrying the GCS message.
async fn check_response(context: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Error::NotFound);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Opaque(map_gcs_error(context, status, &body)))
}

/// Map a GCS HTTP error to an anyhow error with context.
fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
    if let Ok(err_resp) = serde_json::from_str::<GcsErrorResponse>(body) {
        if let Some(err) = err_resp.error {
            return anyhow::anyhow!(
                "GCS {}: {} (code {})",
                context,
                err.message.unwrap_or_default(),
                err.code.unwrap_or(status.as_u16())
            );
        }
    }
    anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
}

/// Convert an object resource into meta info named `name`.
fn meta_info(name: String, obj: GcsObject) -> Result<MetaInfo> {
    let size = match obj.size.as_deref() {
        None | Some("") => 0,
        Some(s) => s
            .parse::<u64>()
            .map_err(|e| Error::opaque("GCS object size", e))?,
    };
    let mod_time = match obj.updated.as_deref() {
        None | Some("") => DateTime::<Utc>::default(),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map_err(|e| Error::opaque("GCS object updated", e))?
            .with_timezone(&Utc),
    };
    Ok(MetaInfo {
        name,
        size,
        mod_time,
        content_type: obj.content_type.unwrap_or_default(),
        metadata: norm_metadata(obj.metadata.unwrap_or_default()),
    })
}

/// Listing entries for one page; a malformed item fails the whole page.
fn list_entries(items: Vec<GcsObject>) -> Result<Vec<ObjectEntry>> {
    items
        .into_iter()
        .map(|mut obj| {
            let name = obj
                .name
                .take()
                .ok_or_else(|| Error::opaque("GCS list", "item without a name"))?;
            let info = meta_info(name, obj)?;
            Ok(ObjectEntry {
                name: info.name,
                size: info.size,
                mod_time: info.mod_time,
            })
        })
        .collect()
}

/// Opening and closing framing of a `multipart/related` upload body; the
/// object bytes go between them.
fn multipart_frame(
    boundary: &str,
    resource: &UploadResource<'_>,
    content_type: &str,
) -> Result<(Bytes, Bytes)> {
    let json = serde_json::to_string(resource)
        .map_err(|e| Error::opaque("GCS upload resource", e))?;
    let media_type = match content_type {
        "" => "application/octet-stream",
        ct => ct,
    };
    let head = format!(
        "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{json}\r\n\
         --{boundary}\r\nContent-Type: {media_type}\r\n\r\n"
    );
    let tail = format!("\r\n--{boundary}--\r\n");
    Ok((Bytes::from(head), Bytes::from(tail)))
}

/// URL-encode a GCS object name for use in API paths.
fn url_encode(name: &str) -> String {
    percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bucket(prefix: &str) -> GcsBucket {
        let mut cfg = GcpStorageConfig::new("my-bucket");
        cfg.prefix = prefix.to_string();
        cfg.endpoint_url = "http://127.0.0.1:4443/".to_string();
        GcsBucket::new(&cfg).await.unwrap()
    }

    #[tokio::test]
    async fn test_endpoint_and_urls() {
        let b = bucket("pre").await;
        assert!(b.inner.anonymous);
        assert_eq!(
            b.inner.object_url("pre/a b.txt"),
            "http://127.0.0.1:4443/storage/v1/b/my%2Dbucket/o/pre%2Fa%20b%2Etxt"
        );
        assert_eq!(
            b.inner.upload_url(),
            "http://127.0.0.1:4443/upload/storage/v1/b/my%2Dbucket/o"
        );
        assert!(b
            .inner
            .rewrite_url("x", "y")
            .ends_with("/o/x/rewriteTo/b/my%2Dbucket/o/y"));
    }

    #[tokio::test]
    async fn test_keys_are_namespaced() {
        let b = bucket("/pre/").await;
        assert_eq!(b.key("a/b.txt").as_deref(), Some("pre/a/b.txt"));
        assert_eq!(b.key("../../etc").as_deref(), Some("pre/etc"));
        assert_eq!(b.key(".."), None);
    }

    #[tokio::test]
    async fn test_invalid_pattern_needs_no_connection() {
        let b = bucket("").await;
        assert!(matches!(
            b.glob("{a,b").unwrap_err(),
            Error::InvalidPattern { .. }
        ));
    }

    #[test]
    fn test_meta_info_from_resource() {
        let obj: GcsObject = serde_json::from_str(
            r#"{"name":"pre/a","size":"42","updated":"2024-01-02T03:04:05.678Z",
                "contentType":"text/plain","metadata":{"x-owner":"me"}}"#,
        )
        .unwrap();
        let info = meta_info("a".to_string(), obj).unwrap();
        assert_eq!(info.size, 42);
        assert_eq!(info.mod_time.timestamp(), 1_704_164_645);
        assert_eq!(info.content_type, "text/plain");
        assert_eq!(info.metadata.get("X-Owner").map(String::as_str), Some("me"));
    }

    #[test]
    fn test_meta_info_rejects_bad_size() {
        let obj = GcsObject {
            size: Some("lots".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            meta_info("a".to_string(), obj),
            Err(Error::Opaque(_))
        ));
    }

    #[test]
    fn test_list_entries_fails_on_malformed_item() {
        let list: GcsListResponse = serde_json::from_str(
            r#"{"items":[{"name":"p/ok","size":"3"},{"name":"p/a","size":"x"}]}"#,
        )
        .unwrap();
        let err = list_entries(list.items.unwrap()).unwrap_err();
        assert!(matches!(err, Error::Opaque(_)));

        let nameless = vec![GcsObject {
            size: Some("1".to_string()),
            ..Default::default()
        }];
        assert!(list_entries(nameless).is_err());
    }

    #[test]
    fn test_list_entries() {
        let list: GcsListResponse = serde_json::from_str(
            r#"{"items":[{"name":"p/a","size":"3","updated":"2024-01-02T03:04:05Z"}],
                "nextPageToken":"t"}"#,
        )
        .unwrap();
        let entries = list_entries(list.items.unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "p/a");
        assert_eq!(entries[0].size, 3);
    }

    #[test]
    fn test_multipart_frame() {
        let resource = UploadResource {
            name: "pre/a.txt",
            content_type: None,
            metadata: HashMap::new(),
            md5_hash: "XUFAKrxLKna5cZ2REBfFkg==".to_string(),
        };
        let (head, tail) = multipart_frame("B", &resource, "").unwrap();
        let head = std::str::from_utf8(&head).unwrap();
        assert!(head.starts_with("--B\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n"));
        assert!(head.contains(r#"{"name":"pre/a.txt","md5Hash":"XUFAKrxLKna5cZ2REBfFkg=="}"#));
        assert!(head.ends_with("--B\r\nContent-Type: application/octet-stream\r\n\r\n"));
        assert_eq!(&tail[..], b"\r\n--B--\r\n");
    }

    #[test]
    fn test_map_gcs_error() {
        let body = r#"{"error":{"code":403,"message":"Access denied."}}"#;
        let err = map_gcs_error("head", StatusCode::FORBIDDEN, body);
        assert_eq!(err.to_string(), "GCS head: Access denied. (code 403)");

        let err = map_gcs_error("list", StatusCode::BAD_GATEWAY, "upstream");
        assert!(err.to_string().contains("HTTP 502"));
    }

    #[test]
    fn test_sign_jwt_rejects_bad_key() {
        let err = sign_jwt(
            "svc@example.iam.gserviceaccount.com",
            "not a pem",
            GOOGLE_TOKEN_URI,
            &["scope".to_string()],
        )
        .unwrap_err();
        assert!(err.to_string().contains("private key"));
    }
}
