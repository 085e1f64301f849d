//! 💀 Job-level failures: the ones that end a run instead of skipping an item.
//!
//! Per-item trouble (missing keys, failed fetches) never shows up here; it lands in the
//! [`RunSummary`] as an outcome and the run goes on.

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::job::RunSummary;
use crate::relay::RelayError;
use crate::uploader::UploadError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The encoder refused an operation or its sink broke. Programming error or dead relay.
    #[error("archive encoding failed")]
    ArchiveEncoding(#[source] ArchiveError),

    /// The relay was used outside its close sequence.
    #[error("archive relay failed")]
    Relay(#[source] RelayError),

    /// Every fetch may have gone fine; the archive still never made it to the destination.
    #[error("upload of archive '{destination}' failed; nothing was published")]
    DestinationUpload {
        destination: String,
        /// What the producer side accomplished before the upload gave out.
        summary: Box<RunSummary>,
        #[source]
        source: UploadError,
    },

    #[error("{worker} worker panicked: {message}")]
    WorkerPanicked {
        worker: &'static str,
        message: String,
    },

    #[error("invalid job: {0}")]
    InvalidJob(String),
}

impl From<ArchiveError> for PipelineError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Relay(relay) => PipelineError::Relay(relay),
            other => PipelineError::ArchiveEncoding(other),
        }
    }
}

impl PipelineError {
    /// The producer-side summary, when the failure happened after the producer finished.
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            PipelineError::DestinationUpload { summary, .. } => Some(summary),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_relay_trouble_inside_the_encoder_is_called_relay_trouble() {
        let err: PipelineError = ArchiveError::Relay(RelayError::Closed).into();
        assert!(matches!(err, PipelineError::Relay(RelayError::Closed)));
        let err: PipelineError = ArchiveError::NoOpenEntry.into();
        assert!(matches!(err, PipelineError::ArchiveEncoding(ArchiveError::NoOpenEntry)));
    }

    #[test]
    fn the_one_where_an_upload_failure_still_carries_the_bookkeeping() {
        let mut summary = RunSummary::new("out.zip");
        summary.attempted = 2;
        summary.transferred = 2;
        let err = PipelineError::DestinationUpload {
            destination: "out.zip".into(),
            summary: Box::new(summary),
            source: UploadError::SourceAborted,
        };
        assert_eq!(err.summary().map(|s| s.transferred), Some(2));
        assert!(err.to_string().contains("out.zip"));
    }
}
