//! 📤 The Remote Sink Uploader: pulls archive bytes off the relay and ships them as one object.
//!
//! 🧠 Knowledge graph:
//! - Pull-based. The uploader reads from the [`RelayReader`]; nobody pushes to it.
//! - Bytes are cut into `part_size` parts and sent as a multipart upload. The destination
//!   object exists only after `complete_upload`, which happens only after a clean
//!   end-of-stream. Anything else ends in `abort_upload`.
//! - After a failure the uploader keeps draining the relay until the producer is done,
//!   so the producer never parks forever on a reader that quit.
//! - Every remote call carries the same deadline (`request_timeout`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::backends::{ObjectStore, StoreError, UploadedPart};
use crate::relay::{RelayError, RelayReader};

/// 💀 Why the destination object was not created.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{stage} failed")]
    Store {
        stage: String,
        #[source]
        source: StoreError,
    },
    /// The archive stream ended without being sealed: the producer gave up.
    #[error("the archive stream ended without being sealed")]
    SourceAborted,
    #[error("relay failed")]
    Relay(#[source] RelayError),
}

impl From<RelayError> for UploadError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::WriterAborted => UploadError::SourceAborted,
            other => UploadError::Relay(other),
        }
    }
}

/// 📊 What went up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadReport {
    pub bytes: u64,
    pub parts: usize,
}

/// 📤 One upload of one relay into one destination key.
#[derive(Debug, Clone)]
pub struct RelayUploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    part_size: usize,
    request_timeout: Duration,
}

/// ⏱️ Run a store call under a deadline, labelling any failure with its stage.
async fn within<T>(
    limit: Duration,
    stage: String,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, UploadError> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(UploadError::Store { stage, source }),
        Err(_) => Err(UploadError::Store {
            source: StoreError::TimedOut {
                context: stage.clone(),
                elapsed: limit,
            },
            stage,
        }),
    }
}

impl RelayUploader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        part_size: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
            part_size: part_size.max(1),
            request_timeout,
        }
    }

    /// 🚀 Upload everything the relay yields. Returns only after the relay hit end-of-stream
    /// (or was abandoned by its writer), whatever happened to the upload.
    pub async fn run(self, reader: &mut RelayReader) -> Result<UploadReport, UploadError> {
        let upload_id = match within(
            self.request_timeout,
            format!("starting upload of '{}'", self.key),
            self.store.create_upload(&self.bucket, &self.key),
        )
        .await
        {
            Ok(id) => id,
            Err(err) => {
                self.drain(reader).await;
                return Err(err);
            }
        };
        debug!("📤 multipart upload {upload_id} started for '{}'", self.key);

        match self.pump(reader, &upload_id).await {
            Ok(report) => {
                info!(
                    "📤 uploaded '{}': {} bytes in {} parts",
                    self.key, report.bytes, report.parts
                );
                Ok(report)
            }
            Err(err) => {
                warn!("📤 upload of '{}' failed, aborting: {err}", self.key);
                self.abort(&upload_id).await;
                self.drain(reader).await;
                Err(err)
            }
        }
    }

    async fn pump(
        &self,
        reader: &mut RelayReader,
        upload_id: &str,
    ) -> Result<UploadReport, UploadError> {
        let mut parts: Vec<UploadedPart> = Vec::new();
        let mut buffer: Vec<u8> = Vec::with_capacity(self.part_size);
        let mut report = UploadReport::default();

        while let Some(chunk) = reader.read_chunk().await? {
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= self.part_size {
                let rest = buffer.split_off(self.part_size);
                let part = std::mem::replace(&mut buffer, rest);
                report.bytes += part.len() as u64;
                parts.push(self.send_part(upload_id, parts.len() + 1, part).await?);
            }
        }

        // -- 🏁 sealed. the last part may be short, and a part is owed even if nothing arrived
        if !buffer.is_empty() || parts.is_empty() {
            report.bytes += buffer.len() as u64;
            parts.push(self.send_part(upload_id, parts.len() + 1, buffer).await?);
        }
        report.parts = parts.len();

        within(
            self.request_timeout,
            format!("completing upload of '{}'", self.key),
            self.store
                .complete_upload(&self.bucket, &self.key, upload_id, parts),
        )
        .await?;
        Ok(report)
    }

    async fn send_part(
        &self,
        upload_id: &str,
        index: usize,
        data: Vec<u8>,
    ) -> Result<UploadedPart, UploadError> {
        let part_number = i32::try_from(index).map_err(|_| UploadError::Store {
            stage: format!("numbering part {index}"),
            source: StoreError::Protocol("more parts than a multipart upload allows".into()),
        })?;
        trace!("🧩 part {part_number}: {} bytes", data.len());
        within(
            self.request_timeout,
            format!("uploading part {part_number} of '{}'", self.key),
            self.store
                .upload_part(&self.bucket, &self.key, upload_id, part_number, data),
        )
        .await
    }

    /// Best effort. A failed abort leaves an invisible, incomplete upload; it is logged, not raised.
    async fn abort(&self, upload_id: &str) {
        let aborted = within(
            self.request_timeout,
            format!("aborting upload of '{}'", self.key),
            self.store.abort_upload(&self.bucket, &self.key, upload_id),
        )
        .await;
        if let Err(err) = aborted {
            warn!("🗑️ could not abort upload {upload_id}: {err}");
        }
    }

    /// 🧹 Keep the producer moving after we've stopped caring about its bytes.
    async fn drain(&self, reader: &mut RelayReader) {
        match reader.drain().await {
            Ok(discarded) => debug!("🧹 discarded {discarded} archive bytes after failure"),
            Err(err) => debug!("🧹 relay ended while draining: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{InMemoryStore, StoreCall};
    use crate::relay::{RelayConfig, relay};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn uploader(store: &InMemoryStore, part_size: usize) -> RelayUploader {
        RelayUploader::new(Arc::new(store.clone()), "b", "out.zip", part_size, TIMEOUT)
    }

    #[tokio::test]
    async fn the_one_where_bytes_go_up_in_parts_and_come_out_whole() {
        let store = InMemoryStore::new();
        let (mut writer, mut reader, _) = relay(RelayConfig::new(64, 16));
        let producer = tokio::spawn(async move {
            for i in 0..10u8 {
                writer.write(&[i; 10]).await.expect("write");
            }
            writer.close();
        });

        let report = uploader(&store, 32).run(&mut reader).await.expect("upload");
        producer.await.expect("producer");

        assert_eq!(report, UploadReport { bytes: 100, parts: 4 });
        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 10]).collect();
        assert_eq!(store.object("b", "out.zip").await, Some(expected));
    }

    #[tokio::test]
    async fn the_one_where_an_empty_stream_still_makes_one_part() {
        let store = InMemoryStore::new();
        let (mut writer, mut reader, _) = relay(RelayConfig::default());
        writer.close();

        let report = uploader(&store, 32).run(&mut reader).await.expect("upload");
        assert_eq!(report.parts, 1);
        assert_eq!(store.object("b", "out.zip").await, Some(Vec::new()));
    }

    #[tokio::test]
    async fn the_one_where_a_failed_part_aborts_and_keeps_draining() {
        let store = InMemoryStore::new();
        store.fail_upload_part(2).await;
        let (mut writer, mut reader, _) = relay(RelayConfig::new(16, 16));
        let producer = tokio::spawn(async move {
            // -- far more than fits in the relay: only a draining reader lets this finish
            for _ in 0..50 {
                writer.write(&[7u8; 16]).await.expect("producer is never refused");
            }
            writer.close();
        });

        let err = uploader(&store, 32).run(&mut reader).await.expect_err("part 2");
        producer.await.expect("producer finished its pass");

        assert!(matches!(err, UploadError::Store { .. }));
        assert!(store.object("b", "out.zip").await.is_none());
        assert_eq!(store.aborted_uploads().await, 1);
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn the_one_where_a_refused_completion_leaves_nothing_readable() {
        let store = InMemoryStore::new();
        store.fail_complete().await;
        let (mut writer, mut reader, _) = relay(RelayConfig::default());
        writer.write(b"PK whatever").await.expect("write");
        writer.close();

        let err = uploader(&store, 32).run(&mut reader).await.expect_err("complete");
        assert!(err.to_string().contains("completing upload"));
        assert!(store.object("b", "out.zip").await.is_none());
        assert_eq!(store.aborted_uploads().await, 1);
    }

    #[tokio::test]
    async fn the_one_where_an_unsealed_stream_is_never_published() {
        let store = InMemoryStore::new();
        let (mut writer, mut reader, _) = relay(RelayConfig::default());
        writer.write(b"half an archive").await.expect("write");
        drop(writer);

        let err = uploader(&store, 32).run(&mut reader).await.expect_err("aborted");
        assert!(matches!(err, UploadError::SourceAborted));
        assert!(store.object("b", "out.zip").await.is_none());
        let calls = store.calls().await;
        assert!(!calls.iter().any(|c| matches!(c, StoreCall::CompleteUpload { .. })));
        assert!(calls.contains(&StoreCall::AbortUpload { key: "out.zip".into() }));
    }
}
