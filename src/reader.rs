//! Length-bounded object reader returned by `Bucket::open`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Content length for bodies whose size the backend does not report; the
/// reader then runs until the transport ends.
pub const UNKNOWN_LENGTH: u64 = u64::MAX;

/// Streams an object's body, stopping cleanly after the declared content
/// length even if the transport would deliver more.  A transport that ends
/// before the declared length fails with `UnexpectedEof`.
pub struct ObjectReader {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    content_length: u64,
    remaining: u64,
}

impl ObjectReader {
    pub fn new(inner: impl AsyncRead + Send + 'static, content_length: u64) -> Self {
        Self {
            inner: Box::pin(inner),
            content_length,
            remaining: content_length,
        }
    }

    /// Declared size of the object in bytes.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Read the rest of the object into memory.
    pub async fn read_all(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.remaining.min(8 * 1024 * 1024) as usize);
        self.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }

        let limit = buf.remaining().min(self.remaining.min(usize::MAX as u64) as usize);
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(limit));
        match self.inner.as_mut().poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                if n == 0 && limit > 0 && self.content_length != UNKNOWN_LENGTH {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "object body ended {} bytes short of {}",
                            self.remaining, self.content_length
                        ),
                    )));
                }
                buf.advance(n);
                self.remaining -= n as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("content_length", &self.content_length)
            .field("remaining", &self.remaining)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stops_at_declared_length() {
        let body = std::io::Cursor::new(b"hello world, and then some".to_vec());
        let reader = ObjectReader::new(body, 11);
        assert_eq!(reader.read_all().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_zero_length_reads_nothing() {
        let body = std::io::Cursor::new(b"junk".to_vec());
        let reader = ObjectReader::new(body, 0);
        assert!(reader.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let body = std::io::Cursor::new(b"abc".to_vec());
        let reader = ObjectReader::new(body, 10);
        let err = reader.read_all().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_unknown_length_reads_to_end() {
        let body = std::io::Cursor::new(b"abc".to_vec());
        let reader = ObjectReader::new(body, UNKNOWN_LENGTH);
        assert_eq!(reader.read_all().await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_small_buffers() {
        let body = std::io::Cursor::new(b"0123456789".to_vec());
        let mut reader = ObjectReader::new(body, 7);
        let mut out = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(out, b"0123456");
    }
}
