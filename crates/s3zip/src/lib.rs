//! 🗜️ s3zip: every object under an S3 prefix, zipped into one object, no disk in between.
//!
//! Two workers share a bounded in-memory relay. One fetches source objects in order and
//! deflates them into a zip stream; the other uploads that stream as a multipart object
//! while it is still being written. The archive never exists in full anywhere but the
//! destination. 🦆

pub mod app_config;
pub mod archive;
pub mod backends;
pub mod error;
pub mod job;
pub mod progress;
pub mod relay;
mod supervisors;
pub mod transfer;
pub mod uploader;

pub use error::PipelineError;
pub use job::{JobDescriptor, RunSummary, TransferOutcome, TransferStatus};
pub use supervisors::{PipelineState, Supervisor, run_blocking};
