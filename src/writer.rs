//! Staged, one-shot object writer.
//!
//! Bytes written to a [`Writer`] land in a private temporary file.  Nothing
//! reaches the backend until [`Writer::commit`], which hands the finished
//! file to the backend's [`Publisher`] and then deletes it.  A single atomic
//! gate makes `commit`/`discard` take effect at most once between them.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::metrics;
use crate::storage::backend::{BoxFuture, WriteOptions};

const OPEN: u8 = 0;
const FINALIZING: u8 = 1;
const COMMITTED: u8 = 2;
const DISCARDED: u8 = 3;

/// Observable writer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting bytes (or a commit is in flight).
    Open,
    /// Published successfully.
    Committed,
    /// Discarded, dropped, or a commit failed.
    Discarded,
}

/// A fully written staging file, ready to publish.
#[derive(Debug)]
pub struct StagedObject {
    pub path: PathBuf,
    pub size: u64,
    pub md5: [u8; 16],
}

impl StagedObject {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Base64 MD5 digest, as used by `Content-MD5` and GCS `md5Hash`.
    pub fn content_md5(&self) -> String {
        BASE64_STANDARD.encode(self.md5)
    }

    /// Hex MD5 digest.
    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }
}

/// Backend upload primitive used by [`Writer::commit`].
pub trait Publisher: Send + Sync + 'static {
    /// Short backend label for logs and metrics.
    fn backend(&self) -> &'static str;

    /// Upload `staged` as the object at backend `key`, replacing any
    /// existing object.
    fn publish<'a>(
        &'a self,
        key: &'a str,
        staged: &'a StagedObject,
        opts: &'a WriteOptions,
    ) -> BoxFuture<'a, Result<()>>;
}

struct Staging {
    file: NamedTempFile,
    hasher: Md5,
    size: u64,
}

/// Transactional write handle returned by `Bucket::create`.
///
/// Not meant for concurrent writes; `commit` and `discard` take `&self` so
/// that a racing pair still resolves through the gate.
pub struct Writer {
    name: String,
    key: String,
    opts: WriteOptions,
    publisher: Arc<dyn Publisher>,
    staging: Mutex<Option<Staging>>,
    state: AtomicU8,
}

impl Writer {
    /// Create a writer staging into a fresh temporary file.
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        opts: WriteOptions,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let file = tempfile::Builder::new().prefix("bucketfs-").tempfile()?;
        let name = name.into();
        let key = key.into();

        debug!(
            "staging write: backend={} key={} tmp={:?}",
            publisher.backend(),
            key,
            file.path()
        );

        Ok(Self {
            name,
            key,
            opts,
            publisher,
            staging: Mutex::new(Some(Staging {
                file,
                hasher: Md5::new(),
                size: 0,
            })),
            state: AtomicU8::new(OPEN),
        })
    }

    /// Object name relative to the bucket.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WriterState {
        match self.state.load(Ordering::Acquire) {
            COMMITTED => WriterState::Committed,
            DISCARDED => WriterState::Discarded,
            _ => WriterState::Open,
        }
    }

    /// Bytes staged so far.
    pub fn len(&self) -> u64 {
        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |s| s.size)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the finalize gate and take ownership of the staging file.
    fn begin_finalize(&self) -> Result<Staging> {
        self.state
            .compare_exchange(OPEN, FINALIZING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyFinalized)?;

        self.staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyFinalized)
    }

    /// Publish the staged bytes.
    ///
    /// The staging file is removed on every exit path, including when the
    /// returned future is dropped mid-upload.  A second call (or a call after
    /// [`discard`](Self::discard)) fails with [`Error::AlreadyFinalized`].
    pub async fn commit(&self) -> Result<()> {
        let staging = self.begin_finalize()?;
        let mut gate = FinalizeGuard {
            state: &self.state,
            outcome: DISCARDED,
        };

        let backend = self.publisher.backend();
        let size = staging.size;
        let result = self.publish(staging).await;
        if result.is_ok() {
            gate.outcome = COMMITTED;
            metrics::record_bytes_committed(backend, size);
        }
        metrics::record_operation(backend, "commit", &result);
        result
    }

    async fn publish(&self, staging: Staging) -> Result<()> {
        let Staging {
            mut file,
            hasher,
            size,
        } = staging;

        file.flush()?;

        let mut md5 = [0u8; 16];
        md5.copy_from_slice(&hasher.finalize());
        let staged = StagedObject {
            path: file.path().to_path_buf(),
            size,
            md5,
        };

        let result = self
            .publisher
            .publish(&self.key, &staged, &self.opts)
            .await;

        release(file, &self.key);
        result
    }

    /// Drop the staged bytes without contacting the backend.
    pub fn discard(&self) -> Result<()> {
        let staging = self.begin_finalize()?;
        self.state.store(DISCARDED, Ordering::Release);
        release(staging.file, &self.key);
        metrics::record_operation(self.publisher.backend(), "discard", &Ok(()));
        Ok(())
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let staging = self
            .staging
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, Error::AlreadyFinalized))?;

        let n = staging.file.write(buf)?;
        staging.hasher.update(&buf[..n]);
        staging.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self
            .staging
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(staging) => staging.file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if *self.state.get_mut() == OPEN {
            debug!("writer dropped without commit, discarding: key={}", self.key);
            *self.state.get_mut() = DISCARDED;
        }
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// Stores the final state when the commit path ends, however it ends.
struct FinalizeGuard<'a> {
    state: &'a AtomicU8,
    outcome: u8,
}

impl Drop for FinalizeGuard<'_> {
    fn drop(&mut self) {
        self.state.store(self.outcome, Ordering::Release);
    }
}

/// Delete a staging file; failures are only logged.
fn release(file: NamedTempFile, key: &str) {
    if let Err(e) = file.close() {
        warn!("failed to remove staging file for {}: {}", key, e);
    }
}
