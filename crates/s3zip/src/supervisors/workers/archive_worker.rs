//! 🗜️ The ArchiveWorker: the producer half of the pipeline.
//!
//! 🎬 *[a list of keys. a zip encoder. a relay with limited patience.]*
//!
//! For each key, in order: skip it if blank, probe it, fetch it into a fresh archive
//! entry, record how it went, tell the progress sink. Then finalize the archive and
//! seal the relay. One key at a time, because the relay cannot seek and the archive
//! order is the key order.
//!
//! 🧠 Knowledge graph:
//! - Per-item trouble becomes a [`TransferOutcome`]. Only encoder/relay failures end the run.
//! - On a fatal error the encoder (and with it the relay writer) is dropped unsealed.
//!   The uploader sees `WriterAborted` and aborts instead of publishing half an archive.
//! - `probe_before_fetch = false` skips the HEAD and lets a NotFound from the GET
//!   mean "missing". One round trip instead of two, same outcomes.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Worker;
use crate::app_config::PipelineConfig;
use crate::archive::ZipEncoder;
use crate::backends::{ObjectStore, StoreError};
use crate::error::PipelineError;
use crate::job::{JobDescriptor, RunSummary, TransferOutcome, is_blank_key};
use crate::progress::ProgressSink;
use crate::relay::RelayWriter;
use crate::supervisors::PipelineState;
use crate::transfer::{FetchFailure, Presence, fetch_entry, probe_existence};

/// 📋 What the producer hands back: its bookkeeping, and whether it had to bail.
#[derive(Debug)]
pub(crate) struct ProducerOutcome {
    pub(crate) summary: RunSummary,
    pub(crate) failure: Option<PipelineError>,
}

pub(crate) struct ArchiveWorker {
    store: Arc<dyn ObjectStore>,
    job: Arc<JobDescriptor>,
    encoder: ZipEncoder<RelayWriter>,
    settings: PipelineConfig,
    progress: Arc<dyn ProgressSink>,
    state: Arc<watch::Sender<PipelineState>>,
}

impl std::fmt::Debug for ArchiveWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWorker")
            .field("job", &self.job)
            .field("encoder", &self.encoder)
            .finish()
    }
}

impl ArchiveWorker {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        job: Arc<JobDescriptor>,
        writer: RelayWriter,
        settings: PipelineConfig,
        progress: Arc<dyn ProgressSink>,
        state: Arc<watch::Sender<PipelineState>>,
    ) -> Self {
        Self {
            store,
            job,
            encoder: ZipEncoder::new(writer),
            settings,
            progress,
            state,
        }
    }

    /// 🔁 One key, start to finish. `Err` only for failures that end the run.
    async fn transfer(&mut self, key: &str) -> Result<TransferOutcome, PipelineError> {
        let bucket = self.job.bucket();

        let mut size_hint = None;
        if self.settings.probe_before_fetch {
            match probe_existence(
                self.store.as_ref(),
                bucket,
                key,
                self.settings.probe_timeout(),
            )
            .await
            {
                Presence::Exists(meta) => size_hint = meta.size,
                Presence::Absent(err) => {
                    return Ok(TransferOutcome::skipped_missing(key, err.to_string()));
                }
                Presence::TimedOut(limit) => {
                    return Ok(TransferOutcome::failed(
                        key,
                        format!("probe timed out after {limit:?}"),
                    ));
                }
            }
        }

        match fetch_entry(
            self.store.as_ref(),
            &mut self.encoder,
            bucket,
            key,
            self.settings.fetch_timeout(),
            size_hint,
        )
        .await
        {
            Ok(entry) => Ok(TransferOutcome::transferred(key, entry.uncompressed_size)),
            Err(FetchFailure::Source(
                err @ (StoreError::NotFound { .. } | StoreError::AccessDenied { .. }),
            )) if !self.settings.probe_before_fetch => {
                Ok(TransferOutcome::skipped_missing(key, err.to_string()))
            }
            Err(FetchFailure::Source(err)) => Ok(TransferOutcome::failed(key, err.to_string())),
            Err(FetchFailure::Sink(err)) => Err(PipelineError::from(err)),
        }
    }

    async fn produce(&mut self, summary: &mut RunSummary) -> Result<(), PipelineError> {
        let job = Arc::clone(&self.job);
        let total = job.attemptable_keys();
        let mut index = 0usize;
        let mut seen: HashSet<&str> = HashSet::new();

        for key in job.keys() {
            if is_blank_key(key) {
                // -- 🚫 never probed, never fetched, never counted
                summary.record(TransferOutcome::skipped_blank(key));
                continue;
            }
            index += 1;

            let outcome = if seen.insert(key.as_str()) {
                self.transfer(key).await?
            } else {
                TransferOutcome::failed(key, "duplicate key; already in the archive")
            };

            match &outcome.reason {
                Some(reason) => warn!("⚠️ [{index}/{total}] '{key}' {:?}: {reason}", outcome.status),
                None => debug!("✅ [{index}/{total}] '{key}' transferred ({} bytes)", outcome.bytes),
            }
            self.progress.on_item(index, total, &outcome);
            summary.record(outcome);
        }

        let stats = self.encoder.finalize().await?;
        self.encoder.sink_mut().close();
        self.state.send_replace(PipelineState::Draining);
        info!(
            "🗜️ archive complete: {} entries, {} bytes handed to the uploader",
            stats.entries, stats.bytes_written
        );
        Ok(())
    }
}

impl Worker for ArchiveWorker {
    type Output = ProducerOutcome;

    fn start(mut self) -> JoinHandle<Self::Output> {
        tokio::spawn(async move {
            debug!("🗜️ ArchiveWorker started on {} keys", self.job.keys().len());
            let mut summary = RunSummary::new(self.job.destination_key());
            let failure = self.produce(&mut summary).await.err();
            if let Some(err) = &failure {
                warn!("💀 ArchiveWorker giving up: {err}");
            }
            // -- dropping self drops the writer; unsealed if we bailed, which is the point
            drop(self);
            ProducerOutcome { summary, failure }
        })
    }
}
