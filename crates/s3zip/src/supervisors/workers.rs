//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the
//! credit in the sprint retro.
//!
//! Exactly two of them per run:
//! - [`ArchiveWorker`]: the producer. Probes, fetches, encodes, writes into the relay.
//! - [`UploadWorker`]: the consumer. Reads the relay, uploads the archive.
//!
//! They share nothing but the relay. 🦆

use tokio::task::JoinHandle;

mod archive_worker;
mod upload_worker;

pub(crate) use archive_worker::{ArchiveWorker, ProducerOutcome};
pub(crate) use upload_worker::UploadWorker;

/// 🏗️ A background worker, that does work. duh.
pub(crate) trait Worker {
    type Output: Send + 'static;

    /// 🚀 Start the worker. Returns a JoinHandle because we trust but verify.
    fn start(self) -> JoinHandle<Self::Output>;
}
