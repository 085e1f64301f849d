//! 🎬 *[two workers, one pipe, zero temp files]*
//! 🎬 "One builds the zip. One ships it. Neither waits for the other to finish." 🦆
//!
//! 📦 The Supervisor is the Pipeline Coordinator. It builds a fresh relay, starts the
//! two workers on it, waits for both, and turns whatever they report into one result.
//!
//! 🧠 Knowledge graph:
//! - States: `Idle → Running → Draining → Done`, published on a `watch` channel.
//!   The producer flips `Draining` itself, right after sealing the relay.
//! - Error precedence: a broken upload beats the producer tripping over the relay it
//!   broke; otherwise the producer's failure wins (the uploader only aborted because of it).
//! - The workers are private. Nobody outside this module gets to hold one.

mod workers;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::app_config::PipelineConfig;
use crate::backends::ObjectStore;
use crate::error::PipelineError;
use crate::job::{JobDescriptor, RunSummary, is_blank_key};
use crate::progress::{NoProgress, ProgressSink};
use crate::relay::{RelayError, relay};
use crate::uploader::RelayUploader;
use workers::{ArchiveWorker, ProducerOutcome, UploadWorker, Worker};

/// 🚦 Where the coordinator is in its one and only run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Done,
}

/// 📦 The Pipeline Coordinator. Owns the store handle and the settings; builds
/// everything else fresh per run.
pub struct Supervisor {
    store: Arc<dyn ObjectStore>,
    settings: PipelineConfig,
    progress: Arc<dyn ProgressSink>,
    state: Arc<watch::Sender<PipelineState>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("store", &self.store)
            .field("settings", &self.settings)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

/// 💀 A worker died without returning. Dig the panic message out of the body.
fn panicked(worker: &'static str, err: JoinError) -> PipelineError {
    let message = if err.is_cancelled() {
        "task was cancelled".to_string()
    } else {
        let payload = err.into_panic();
        payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string())
    };
    PipelineError::WorkerPanicked { worker, message }
}

impl Supervisor {
    pub fn new(store: Arc<dyn ObjectStore>, settings: PipelineConfig) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            store,
            settings,
            progress: Arc::new(NoProgress),
            state: Arc::new(state),
        }
    }

    /// 📊 Report per-item progress somewhere.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// 👀 Watch the state machine tick over.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn validate(job: &JobDescriptor) -> Result<(), PipelineError> {
        if job.bucket().trim().is_empty() {
            return Err(PipelineError::InvalidJob("source bucket is blank".into()));
        }
        if is_blank_key(job.destination_key()) {
            return Err(PipelineError::InvalidJob("destination key is blank".into()));
        }
        Ok(())
    }

    /// 🚀 Run the pipeline once: archive every key of `job` into its destination key.
    ///
    /// Returns after both workers are done, whatever happened to either of them.
    pub async fn run(&self, job: &JobDescriptor) -> Result<RunSummary, PipelineError> {
        Self::validate(job)?;
        let job = Arc::new(job.clone());

        let (writer, reader, relay_stats) = relay(self.settings.relay());
        let uploader = RelayUploader::new(
            Arc::clone(&self.store),
            job.bucket(),
            job.destination_key(),
            self.settings.part_size_bytes,
            self.settings.upload_timeout(),
        );
        let producer = ArchiveWorker::new(
            Arc::clone(&self.store),
            Arc::clone(&job),
            writer,
            self.settings.clone(),
            Arc::clone(&self.progress),
            Arc::clone(&self.state),
        );
        let consumer = UploadWorker::new(reader, uploader);

        info!(
            "🚀 zipping {} keys from s3://{}/{} into '{}'",
            job.attemptable_keys(),
            job.bucket(),
            job.prefix(),
            job.destination_key()
        );
        self.state.send_replace(PipelineState::Running);
        let (produced, uploaded) = tokio::join!(producer.start(), consumer.start());
        self.state.send_replace(PipelineState::Done);
        debug!("🏁 both workers joined");

        let ProducerOutcome {
            mut summary,
            failure,
        } = produced.map_err(|e| panicked("archive", e))?;
        summary.relay_peak_bytes = relay_stats.peak_buffered_bytes();
        let uploaded = uploaded.map_err(|e| panicked("upload", e));

        let report = match (failure, uploaded) {
            (None, Ok(Ok(report))) => report,
            (None, Err(panic)) => return Err(panic),
            // -- the reader vanished under the producer; the consumer's story is the real one
            (Some(PipelineError::Relay(RelayError::Closed)), Err(panic)) => return Err(panic),
            (None | Some(PipelineError::Relay(RelayError::Closed)), Ok(Err(source))) => {
                return Err(PipelineError::DestinationUpload {
                    destination: job.destination_key().to_string(),
                    summary: Box::new(summary),
                    source,
                });
            }
            (Some(failure), _) => return Err(failure),
        };

        summary.archive_bytes = report.bytes;
        self.progress.on_finish(&summary);
        info!(
            "✅ '{}' written: {} transferred, {} skipped, {} failed, {} archive bytes",
            summary.destination_key,
            summary.transferred,
            summary.skipped,
            summary.failed,
            summary.archive_bytes
        );
        Ok(summary)
    }
}

/// 🧱 For callers without a runtime: builds a multi-thread one, runs the job, tears it down.
pub fn run_blocking(
    store: Arc<dyn ObjectStore>,
    settings: PipelineConfig,
    job: &JobDescriptor,
    progress: Arc<dyn ProgressSink>,
) -> anyhow::Result<RunSummary> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("💀 couldn't build a tokio runtime to run the pipeline on")?;
    let supervisor = Supervisor::new(store, settings).with_progress(progress);
    let summary = runtime.block_on(supervisor.run(job))?;
    Ok(summary)
}
