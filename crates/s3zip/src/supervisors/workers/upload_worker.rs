//! 📤 The UploadWorker: drains the relay into the destination object.
//!
//! It receives bytes. It uploads bytes. It asks no questions. When the upload
//! fails it keeps reading anyway, so the producer upstream can finish its pass.

use tokio::task::JoinHandle;
use tracing::debug;

use super::Worker;
use crate::relay::RelayReader;
use crate::uploader::{RelayUploader, UploadError, UploadReport};

#[derive(Debug)]
pub(crate) struct UploadWorker {
    reader: RelayReader,
    uploader: RelayUploader,
}

impl UploadWorker {
    pub(crate) fn new(reader: RelayReader, uploader: RelayUploader) -> Self {
        Self { reader, uploader }
    }
}

impl Worker for UploadWorker {
    type Output = Result<UploadReport, UploadError>;

    fn start(mut self) -> JoinHandle<Self::Output> {
        tokio::spawn(async move {
            debug!("📥 UploadWorker started draining the relay...");
            let result = self.uploader.run(&mut self.reader).await;
            debug!("🏁 UploadWorker: relay exhausted. Shutting down.");
            result
        })
    }
}
