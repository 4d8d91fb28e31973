//! Behaviour every backend must share, run against the filesystem and
//! memory buckets.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::Arc;

use bucketfs::storage::local::LocalBucket;
use bucketfs::storage::memory::{MemoryBucket, MemoryStore};
use bucketfs::{Bucket, Error, WriteOptions, WriterState};
use chrono::Utc;

/// Opens buckets at different prefixes over one shared object store.
struct Fixture {
    _dir: Option<tempfile::TempDir>,
    open: Box<dyn Fn(&str) -> Box<dyn Bucket>>,
}

impl Fixture {
    fn bucket(&self, prefix: &str) -> Box<dyn Bucket> {
        (self.open)(prefix)
    }
}

// Small pages so that every listing spans several fetches.
const PAGE_SIZE: usize = 2;

fn file_fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let root = dir.path().to_path_buf();
    Fixture {
        _dir: Some(dir),
        open: Box::new(move |prefix: &str| -> Box<dyn Bucket> {
            let bucket = LocalBucket::new(&root, prefix)
                .expect("failed to create bucket")
                .with_page_size(PAGE_SIZE);
            Box::new(bucket)
        }),
    }
}

fn mem_fixture() -> Fixture {
    let store: Arc<MemoryStore> = MemoryStore::new(0);
    Fixture {
        _dir: None,
        open: Box::new(move |prefix: &str| -> Box<dyn Bucket> {
            Box::new(MemoryBucket::with_store(store.clone(), prefix).with_page_size(PAGE_SIZE))
        }),
    }
}

async fn put(bucket: &dyn Bucket, name: &str, data: &[u8]) {
    let mut w = bucket
        .create(name, WriteOptions::default())
        .await
        .expect("create");
    w.write_all(data).expect("write");
    w.commit().await.expect("commit");
}

async fn read(bucket: &dyn Bucket, name: &str) -> Vec<u8> {
    let reader = bucket.open(name).await.expect("open");
    reader.read_all().await.expect("read")
}

async fn names(bucket: &dyn Bucket, pattern: &str) -> BTreeSet<String> {
    bucket
        .glob(pattern)
        .expect("glob")
        .collect_names()
        .await
        .expect("list")
        .into_iter()
        .collect()
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

macro_rules! conformance {
    ($backend:ident, $fixture:path) => {
        mod $backend {
            use super::*;

            #[tokio::test]
            async fn commit_then_head_reports_size_and_time() {
                let fx = $fixture();
                let b = fx.bucket("");
                let start = Utc::now();
                put(&*b, "obj.bin", &[7u8; 1234]).await;

                let info = b.head("obj.bin").await.unwrap();
                assert_eq!(info.name, "obj.bin");
                assert_eq!(info.size, 1234);
                assert!(info.mod_time.timestamp() >= start.timestamp());
            }

            #[tokio::test]
            async fn open_returns_committed_bytes() {
                let fx = $fixture();
                let b = fx.bucket("data");
                put(&*b, "a/b.txt", b"hello world").await;

                let reader = b.open("a/b.txt").await.unwrap();
                assert_eq!(reader.content_length(), 11);
                assert_eq!(reader.read_all().await.unwrap(), b"hello world");
            }

            #[tokio::test]
            async fn remove_is_idempotent() {
                let fx = $fixture();
                let b = fx.bucket("");
                put(&*b, "gone", b"x").await;

                b.remove("gone").await.unwrap();
                assert!(b.head("gone").await.unwrap_err().is_not_found());
                assert!(b.open("gone").await.unwrap_err().is_not_found());
                b.remove("gone").await.unwrap();
                b.remove("never-existed").await.unwrap();
            }

            #[tokio::test]
            async fn glob_matches_by_segment() {
                let fx = $fixture();
                let b = fx.bucket("");
                for name in ["a/x.txt", "a/y.bin", "a/b/z.txt"] {
                    put(&*b, name, b"1").await;
                }

                assert_eq!(names(&*b, "a/*.txt").await, set(&["a/x.txt"]));
                assert_eq!(
                    names(&*b, "a/**").await,
                    set(&["a/x.txt", "a/y.bin", "a/b/z.txt"])
                );
                assert_eq!(names(&*b, "**/*.txt").await, set(&["a/x.txt", "a/b/z.txt"]));
                assert_eq!(names(&*b, "**").await, names(&*b, "**").await);
                assert!(names(&*b, "nothing/*").await.is_empty());
            }

            #[tokio::test]
            async fn glob_yields_every_page() {
                let fx = $fixture();
                let b = fx.bucket("paged");
                let expected: BTreeSet<String> = (0..7).map(|i| format!("f{i}.log")).collect();
                for name in &expected {
                    put(&*b, name, b"z").await;
                }
                put(&*b, "skip.txt", b"z").await;

                assert_eq!(names(&*b, "*.log").await, expected);
            }

            #[tokio::test]
            async fn glob_rejects_bad_pattern_up_front() {
                let fx = $fixture();
                let b = fx.bucket("");
                for pattern in ["[", "a/[b", "{x,y"] {
                    let err = b.glob(pattern).unwrap_err();
                    assert!(matches!(err, Error::InvalidPattern { .. }), "{pattern}");
                }
            }

            #[tokio::test]
            async fn iterator_reports_entry_attributes() {
                let fx = $fixture();
                let b = fx.bucket("");
                put(&*b, "sized", b"12345").await;

                let mut it = b.glob("sized").unwrap();
                assert!(it.next().await);
                assert_eq!(it.name(), "sized");
                assert_eq!(it.size(), 5);
                assert!(!it.next().await);
                assert!(it.error().is_none());
                assert_eq!(it.name(), "");
                it.close();
                it.close();
            }

            #[tokio::test]
            async fn second_commit_is_rejected() {
                let fx = $fixture();
                let b = fx.bucket("");
                let mut w = b.create("once", WriteOptions::default()).await.unwrap();
                w.write_all(b"first").unwrap();
                w.commit().await.unwrap();
                assert_eq!(w.state(), WriterState::Committed);

                assert!(matches!(
                    w.commit().await.unwrap_err(),
                    Error::AlreadyFinalized
                ));
                assert!(matches!(w.discard().unwrap_err(), Error::AlreadyFinalized));
                assert_eq!(read(&*b, "once").await, b"first");
            }

            #[tokio::test]
            async fn discard_publishes_nothing() {
                let fx = $fixture();
                let b = fx.bucket("");
                let mut w = b.create("draft", WriteOptions::default()).await.unwrap();
                w.write_all(b"partial").unwrap();
                w.discard().unwrap();
                assert_eq!(w.state(), WriterState::Discarded);
                assert!(matches!(
                    w.commit().await.unwrap_err(),
                    Error::AlreadyFinalized
                ));

                assert!(b.head("draft").await.unwrap_err().is_not_found());
                assert!(names(&*b, "**").await.is_empty());
            }

            #[tokio::test]
            async fn dropped_writer_publishes_nothing() {
                let fx = $fixture();
                let b = fx.bucket("");
                {
                    let mut w = b.create("dropped", WriteOptions::default()).await.unwrap();
                    w.write_all(b"lost").unwrap();
                }
                assert!(b.head("dropped").await.unwrap_err().is_not_found());
            }

            #[tokio::test]
            async fn commit_overwrites() {
                let fx = $fixture();
                let b = fx.bucket("");
                put(&*b, "key", b"version 1").await;
                put(&*b, "key", b"v2").await;
                assert_eq!(read(&*b, "key").await, b"v2");
                assert_eq!(b.head("key").await.unwrap().size, 2);
            }

            #[tokio::test]
            async fn copy_duplicates_bytes() {
                let fx = $fixture();
                let b = fx.bucket("ns");
                put(&*b, "src/a.txt", b"copy me").await;

                b.copy("src/a.txt", "dst/b.txt").await.unwrap();
                assert_eq!(read(&*b, "dst/b.txt").await, b"copy me");
                assert_eq!(read(&*b, "src/a.txt").await, b"copy me");
                assert_eq!(
                    b.head("dst/b.txt").await.unwrap().size,
                    b.head("src/a.txt").await.unwrap().size
                );

                assert!(b.copy("missing", "x").await.unwrap_err().is_not_found());
            }

            #[tokio::test]
            async fn namespace_is_isolated() {
                let fx = $fixture();
                let root = fx.bucket("");
                let scoped = fx.bucket("x");
                put(&*root, "outside", b"secret").await;
                put(&*root, "xy/near-miss", b"secret").await;

                put(&*scoped, "../escape", b"inside").await;
                put(&*scoped, "sub/obj", b"inside").await;

                assert_eq!(
                    names(&*root, "**").await,
                    set(&["outside", "xy/near-miss", "x/escape", "x/sub/obj"])
                );
                assert_eq!(names(&*scoped, "**").await, set(&["escape", "sub/obj"]));

                assert!(scoped.head("../outside").await.unwrap_err().is_not_found());
                assert!(scoped.open("/../outside").await.unwrap_err().is_not_found());
                scoped.remove("../outside").await.unwrap();
                assert_eq!(read(&*root, "outside").await, b"secret");
            }

            #[tokio::test]
            async fn root_name_is_invalid_for_create() {
                let fx = $fixture();
                let b = fx.bucket("x");
                for name in ["", "/", "..", "a/../.."] {
                    let err = b.create(name, WriteOptions::default()).await.unwrap_err();
                    assert!(matches!(err, Error::InvalidName(_)), "{name:?}");
                }
            }

            #[tokio::test]
            async fn close_succeeds() {
                let fx = $fixture();
                let b = fx.bucket("");
                b.close().await.unwrap();
            }
        }
    };
}

conformance!(file, file_fixture);
conformance!(mem, mem_fixture);
