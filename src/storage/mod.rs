//! Bucket backends.
//!
//! The [`backend::Bucket`] trait abstracts over where objects physically
//! live.  Implementations include local disk, process memory, AWS S3 and
//! GCP Cloud Storage.

pub mod aws;
pub mod backend;
pub mod gcp;
pub mod local;
pub mod memory;
