//! 📦 Job model: what to zip, where to put it, and how it went.
//!
//! 🧠 Knowledge graph:
//! - [`JobDescriptor`]: immutable once built. Source bucket + prefix, the resolved key list
//!   (order is archive order, blanks allowed and skipped), destination key.
//! - [`TransferOutcome`]: one per source key, produced by the archive worker.
//! - [`RunSummary`]: the outcomes rolled up, handed back to whoever called `run`.

use serde::Serialize;

/// 🏷️ The default archive name: `<prefix without trailing '/'>.<unix seconds>.zip`.
pub fn default_destination_key(prefix: &str, unix_seconds: i64) -> String {
    let stem = prefix.trim_end_matches('/');
    // -- 🪣 an empty prefix means "the whole bucket", and ".1700000000.zip" is a hidden file
    let stem = if stem.is_empty() { "archive" } else { stem };
    format!("{stem}.{unix_seconds}.zip")
}

/// 📋 Everything one run needs to know. Read-only once the pipeline starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    bucket: String,
    prefix: String,
    keys: Vec<String>,
    destination_key: String,
}

impl JobDescriptor {
    pub fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        keys: Vec<String>,
        destination_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            keys,
            destination_key: destination_key.into(),
        }
    }

    /// 🕰️ Same as [`JobDescriptor::new`], destination named after the prefix and the clock.
    pub fn with_default_destination(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        keys: Vec<String>,
    ) -> Self {
        let prefix = prefix.into();
        let destination = default_destination_key(&prefix, chrono::Utc::now().timestamp());
        Self::new(bucket, prefix, keys, destination)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn destination_key(&self) -> &str {
        &self.destination_key
    }

    /// Keys that will actually be attempted (blank ones never are).
    pub fn attemptable_keys(&self) -> usize {
        self.keys.iter().filter(|k| !is_blank_key(k)).count()
    }
}

/// A key made of nothing but whitespace is no key at all.
pub fn is_blank_key(key: &str) -> bool {
    key.trim().is_empty()
}

/// 🚦 How one source key fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Transferred,
    SkippedMissing,
    SkippedBlank,
    Failed,
}

/// 📄 Per-key result record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub key: String,
    pub status: TransferStatus,
    /// Source bytes that went into the archive for this key (0 unless transferred).
    pub bytes: u64,
    /// Why it was skipped or failed, when there is a why.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransferOutcome {
    pub fn transferred(key: &str, bytes: u64) -> Self {
        Self {
            key: key.to_string(),
            status: TransferStatus::Transferred,
            bytes,
            reason: None,
        }
    }

    pub fn skipped_missing(key: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            status: TransferStatus::SkippedMissing,
            bytes: 0,
            reason: Some(reason.into()),
        }
    }

    pub fn skipped_blank(key: &str) -> Self {
        Self {
            key: key.to_string(),
            status: TransferStatus::SkippedBlank,
            bytes: 0,
            reason: None,
        }
    }

    pub fn failed(key: &str, reason: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            status: TransferStatus::Failed,
            bytes: 0,
            reason: Some(reason.into()),
        }
    }
}

/// 📊 The roll-up. Blank keys are recorded in `outcomes` but count toward nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct RunSummary {
    pub destination_key: String,
    pub attempted: usize,
    pub transferred: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Sum of source object bytes that made it into the archive.
    pub source_bytes: u64,
    /// Size of the archive object as uploaded.
    pub archive_bytes: u64,
    /// Most archive bytes that sat in the relay at once.
    pub relay_peak_bytes: usize,
    pub outcomes: Vec<TransferOutcome>,
}

impl RunSummary {
    pub fn new(destination_key: impl Into<String>) -> Self {
        Self {
            destination_key: destination_key.into(),
            ..Self::default()
        }
    }

    /// ➕ Fold one outcome into the counts.
    pub fn record(&mut self, outcome: TransferOutcome) {
        match outcome.status {
            TransferStatus::Transferred => {
                self.attempted += 1;
                self.transferred += 1;
                self.source_bytes += outcome.bytes;
            }
            TransferStatus::SkippedMissing => {
                self.attempted += 1;
                self.skipped += 1;
            }
            TransferStatus::Failed => {
                self.attempted += 1;
                self.failed += 1;
            }
            TransferStatus::SkippedBlank => {}
        }
        self.outcomes.push(outcome);
    }

    /// Keys of entries that made it into the archive, in archive order.
    pub fn archived_keys(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TransferStatus::Transferred)
            .map(|o| o.key.as_str())
    }
}
