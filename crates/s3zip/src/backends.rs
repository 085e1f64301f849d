//! 🔌 Backends: where the real I/O happens.
//!
//! 🪣 An object store is a very large, very patient key/value map that charges per request.
//! This module is the casting agency for them: S3 for production, a local directory for
//! people without an AWS bill, and an in-memory one for tests that need to lie convincingly.
//!
//! 🧠 Knowledge graph:
//! - Pattern: trait ([`ObjectStore`]) → concrete impls (S3Store, FileStore, InMemoryStore)
//!   → enum dispatcher ([`StoreBackend`]) → `from_config` resolver. One trait, since every
//!   store both reads and writes.
//! - Fetch writes into an [`EntrySink`]: append-only, offset-blind. The sink is ultimately
//!   backed by a relay that has no idea what a byte offset is.
//! - Errors are typed ([`StoreError`]) because the pipeline needs to tell "not found" from
//!   "the network is on fire" without string matching.
//!
//! 🦆 The duck stores nothing. The duck travels light.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::app_config::StoreConfig;
use crate::archive::ArchiveError;

pub(crate) mod file;
pub(crate) mod in_mem;
pub(crate) mod s3;

pub use file::{FileStore, FileStoreConfig};
pub use in_mem::{InMemoryStore, StoreCall};
pub use s3::{S3Store, S3StoreConfig};

/// 📦 Boxed error type for "the backend said no and here's its reason".
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 💀 What a storage backend can say when things go sideways.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no object at '{key}'")]
    NotFound { key: String },
    #[error("access denied to '{target}'")]
    AccessDenied { target: String },
    #[error("backend unavailable while {context}")]
    Unavailable {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("{context} timed out after {elapsed:?}")]
    TimedOut { context: String, elapsed: Duration },
    #[error("backend protocol violation: {0}")]
    Protocol(String),
}

impl StoreError {
    pub(crate) fn unavailable(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Unavailable {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// 💀 A fetch can fail on either side of the byte stream, and the two sides mean
/// very different things: the source failing costs one item, the sink failing costs the run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("archive sink rejected fetched bytes")]
    Sink(#[from] ArchiveError),
}

/// 📏 What a successful probe learned about an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    /// Size in bytes, when the backend reports it.
    pub size: Option<u64>,
}

/// 🧩 Receipt for one uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

/// ✍️ Where fetched bytes go: strictly sequential append.
///
/// # Contract 📜
/// - `append` adds bytes to the end of whatever the sink is currently building.
/// - `write_at` exists for callers that think in offsets. The offset is ignored. Always.
///   The bytes are appended. The sink feeds a relay that cannot seek.
#[async_trait]
pub trait EntrySink: Send {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), ArchiveError>;

    async fn write_at(&mut self, bytes: &[u8], _offset: u64) -> Result<usize, ArchiveError> {
        self.append(bytes).await?;
        Ok(bytes.len())
    }
}

#[async_trait]
impl EntrySink for Vec<u8> {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// 🪣 Everything the pipeline needs from an object store.
///
/// # Contract 📜
/// - `list_keys`: every key under `prefix`, in the store's listing order.
/// - `probe`: metadata-only existence check. `NotFound` when absent.
/// - `fetch`: stream the whole object into `sink`, in order, no seeking. Returns bytes fetched.
/// - `create_upload` / `upload_part` / `complete_upload` / `abort_upload`: a multipart
///   upload. Nothing is visible at the destination key until `complete_upload` succeeds,
///   and `abort_upload` makes sure it never becomes visible.
#[async_trait]
pub trait ObjectStore: fmt::Debug + Send + Sync {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn probe(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError>;

    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn EntrySink + Send),
    ) -> Result<u64, FetchError>;

    async fn create_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError>;

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<UploadedPart, StoreError>;

    async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError>;

    async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str)
    -> Result<(), StoreError>;
}

/// 🎭 The many faces of an object store.
///
/// The enum dispatches to the concrete type so the supervisor never needs to know
/// whether the bytes live in RAM, on disk, or in us-east-1.
#[derive(Debug)]
pub enum StoreBackend {
    InMemory(InMemoryStore),
    File(FileStore),
    S3(S3Store),
}

impl StoreBackend {
    /// 🏗️ Resolve a backend from config. S3 needs to load credentials, hence async.
    pub async fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        Ok(match config {
            StoreConfig::InMemory => StoreBackend::InMemory(InMemoryStore::new()),
            StoreConfig::File(file_config) => {
                StoreBackend::File(FileStore::new(file_config.clone())?)
            }
            StoreConfig::S3(s3_config) => StoreBackend::S3(S3Store::new(s3_config.clone()).await),
        })
    }

    fn inner(&self) -> &dyn ObjectStore {
        match self {
            StoreBackend::InMemory(store) => store,
            StoreBackend::File(store) => store,
            StoreBackend::S3(store) => store,
        }
    }
}

#[async_trait]
impl ObjectStore for StoreBackend {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner().list_keys(bucket, prefix).await
    }

    async fn probe(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        self.inner().probe(bucket, key).await
    }

    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn EntrySink + Send),
    ) -> Result<u64, FetchError> {
        self.inner().fetch(bucket, key, sink).await
    }

    async fn create_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        self.inner().create_upload(bucket, key).await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<UploadedPart, StoreError> {
        self.inner()
            .upload_part(bucket, key, upload_id, part_number, data)
            .await
    }

    async fn complete_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        self.inner()
            .complete_upload(bucket, key, upload_id, parts)
            .await
    }

    async fn abort_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        self.inner().abort_upload(bucket, key, upload_id).await
    }
}
