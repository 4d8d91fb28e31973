//! bucketfs -- one bucket API over local disk, memory, S3 and GCS.
//!
//! A [`Bucket`] is opened from a URL (`file:///data`, `mem://name/prefix`,
//! `s3://bucket/prefix`, `gs://bucket/prefix`) through the scheme
//! [`registry`], or from a YAML [`config`].  Every bucket is scoped to a
//! namespace prefix, lists objects lazily by glob pattern, and writes
//! through staged, one-shot [`Writer`]s.

pub mod config;
pub mod errors;
pub mod glob;
pub mod iter;
pub mod metrics;
pub mod namespace;
pub mod reader;
pub mod registry;
pub mod storage;
pub mod writer;

pub use errors::{Error, Result};
pub use iter::{ObjectEntry, ObjectIter};
pub use reader::ObjectReader;
pub use registry::{connect, register, resolve, Scheme};
pub use storage::backend::{Bucket, MetaInfo, WriteOptions};
pub use writer::{Writer, WriterState};
