//! 🔍📥 Per-key transfer steps: the existence probe and the sequential fetch.
//!
//! 🧠 Knowledge graph:
//! - [`probe_existence`]: one metadata call with a deadline. Any backend error counts as
//!   "absent" (the item is skipped and the run goes on). Only the deadline itself is
//!   reported separately, because a probe that never answers is a failure, not an absence.
//! - [`fetch_entry`]: one GET streamed into an [`EntryWriter`], which opens the archive
//!   entry lazily on the first byte. A key that turns out to be missing at fetch time
//!   therefore leaves no trace in the archive.
//! - Source-side failures come back as [`FetchFailure::Source`] (cost: one item).
//!   Sink-side failures come back as [`FetchFailure::Sink`] (cost: the run).
//! - The fetch deadline is charged to the source only. Time spent waiting on the
//!   archive (a full relay behind a slow upload) does not count against it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::archive::{ArchiveError, ByteSink, EntrySummary, ZipEncoder};
use crate::backends::{EntrySink, FetchError, ObjectMeta, ObjectStore, StoreError};

/// 🔍 What the probe concluded.
#[derive(Debug)]
pub enum Presence {
    Exists(ObjectMeta),
    /// Not there, not visible, or not answering sensibly. Skip it.
    Absent(StoreError),
    TimedOut(Duration),
}

/// 🔍 Metadata-only existence check, bounded by `limit`.
pub async fn probe_existence(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    limit: Duration,
) -> Presence {
    match tokio::time::timeout(limit, store.probe(bucket, key)).await {
        Ok(Ok(meta)) => {
            trace!("🔍 '{key}' exists ({:?} bytes)", meta.size);
            Presence::Exists(meta)
        }
        Ok(Err(err)) => {
            debug!("🔍 '{key}' treated as absent: {err}");
            Presence::Absent(err)
        }
        Err(_) => Presence::TimedOut(limit),
    }
}

const NOT_IN_SINK: u64 = u64::MAX;

/// ⏱️ A deadline that only runs while the source has the ball.
///
/// Every stretch between [`SourceClock::enter_sink`] and [`SourceClock::leave_sink`]
/// is taken off the elapsed time. Atomics, so the fetch future stays `Send`.
#[derive(Debug)]
pub struct SourceClock {
    limit: Duration,
    started: Instant,
    sink_nanos: AtomicU64,
    sink_since: AtomicU64,
}

impl SourceClock {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            started: Instant::now(),
            sink_nanos: AtomicU64::new(0),
            sink_since: AtomicU64::new(NOT_IN_SINK),
        }
    }

    fn nanos_since_start(&self) -> u64 {
        self.started.elapsed().as_nanos().min(u64::MAX as u128 - 1) as u64
    }

    pub fn enter_sink(&self) {
        self.sink_since.store(self.nanos_since_start(), Ordering::Release);
    }

    pub fn leave_sink(&self) {
        let since = self.sink_since.swap(NOT_IN_SINK, Ordering::AcqRel);
        if since != NOT_IN_SINK {
            let spent = self.nanos_since_start().saturating_sub(since);
            self.sink_nanos.fetch_add(spent, Ordering::AcqRel);
        }
    }

    /// Time charged to the source so far.
    pub fn source_elapsed(&self) -> Duration {
        let now = self.nanos_since_start();
        let mut in_sink = self.sink_nanos.load(Ordering::Acquire);
        let since = self.sink_since.load(Ordering::Acquire);
        if since != NOT_IN_SINK {
            in_sink += now.saturating_sub(since);
        }
        Duration::from_nanos(now.saturating_sub(in_sink))
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.source_elapsed())
    }

    pub fn expired(&self) -> bool {
        self.source_elapsed() >= self.limit
    }
}

/// ✍️ An [`EntrySink`] that turns fetched bytes into one archive entry.
///
/// The entry is opened on the first append (or at [`EntryWriter::finish`] for an
/// empty object), so nothing reaches the archive until the source actually delivers.
pub struct EntryWriter<'a, S> {
    encoder: &'a mut ZipEncoder<S>,
    name: &'a str,
    size_hint: Option<u64>,
    clock: Option<&'a SourceClock>,
    opened: bool,
    bytes: u64,
}

impl<'a, S: ByteSink> EntryWriter<'a, S> {
    pub fn new(encoder: &'a mut ZipEncoder<S>, name: &'a str) -> Self {
        Self {
            encoder,
            name,
            size_hint: None,
            clock: None,
            opened: false,
            bytes: 0,
        }
    }

    /// Expected source size, when a listing or metadata call already told us.
    pub fn with_size_hint(mut self, size_hint: Option<u64>) -> Self {
        self.size_hint = size_hint;
        self
    }

    /// Stop `clock` whenever this writer is busy pushing into the archive.
    pub fn with_clock(mut self, clock: &'a SourceClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Source bytes appended so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// True once any part of this entry reached the encoder.
    pub fn is_opened(&self) -> bool {
        self.opened
    }

    async fn ensure_open(&mut self) -> Result<(), ArchiveError> {
        if !self.opened {
            self.encoder.open_entry_sized(self.name, self.size_hint).await?;
            self.opened = true;
        }
        Ok(())
    }

    /// ✅ Seal the entry into the archive directory.
    pub async fn finish(mut self) -> Result<EntrySummary, ArchiveError> {
        self.ensure_open().await?;
        self.encoder.close_entry().await
    }

    /// 🗑️ Drop the entry. If it was never opened there is nothing to undo.
    pub async fn abandon(self) -> Result<(), ArchiveError> {
        // -- an open_entry cut short still left the entry open in the encoder
        if self.opened || self.encoder.current_entry() == Some(self.name) {
            self.encoder.abandon_entry().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<'a, S: ByteSink> EntrySink for EntryWriter<'a, S> {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        if let Some(clock) = self.clock {
            clock.enter_sink();
        }
        let written = match self.ensure_open().await {
            Ok(()) => self.encoder.write(bytes).await,
            Err(err) => Err(err),
        };
        if let Some(clock) = self.clock {
            clock.leave_sink();
        }
        written?;
        self.bytes += bytes.len() as u64;
        Ok(())
    }
}

/// 💀 Why a fetch did not produce an entry.
#[derive(Debug)]
pub enum FetchFailure {
    /// The source side failed. The item is lost, the run is not.
    Source(StoreError),
    /// The archive side failed. Nothing downstream can be trusted any more.
    Sink(ArchiveError),
}

/// 📥 Stream `key` into a fresh archive entry.
///
/// `limit` bounds the time the source spends delivering; waits on the archive side
/// are not counted. `size_hint` is the expected object size, if known. On a source
/// failure the partially written entry (if any) is abandoned before returning, so
/// the caller only has to record the outcome.
pub async fn fetch_entry<S: ByteSink>(
    store: &dyn ObjectStore,
    encoder: &mut ZipEncoder<S>,
    bucket: &str,
    key: &str,
    limit: Duration,
    size_hint: Option<u64>,
) -> Result<EntrySummary, FetchFailure> {
    // -- 🧹 a fetch dropped mid-entry must not get sealed by the next open
    if let Some(stale) = encoder.current_entry().map(str::to_owned) {
        debug!("🗑️ dropping '{stale}', left open by an interrupted fetch");
        encoder.abandon_entry().await.map_err(FetchFailure::Sink)?;
    }

    let clock = SourceClock::new(limit);
    let mut writer = EntryWriter::new(encoder, key)
        .with_size_hint(size_hint)
        .with_clock(&clock);
    let fetched = {
        let fetch = store.fetch(bucket, key, &mut writer);
        tokio::pin!(fetch);
        loop {
            tokio::select! {
                biased;
                result = &mut fetch => break Some(result),
                _ = tokio::time::sleep(clock.remaining()) => {
                    if clock.expired() {
                        break None;
                    }
                }
            }
        }
    };

    let source_error = match fetched {
        Some(Ok(bytes)) => {
            trace!("📥 fetched {bytes} bytes of '{key}'");
            return writer.finish().await.map_err(FetchFailure::Sink);
        }
        Some(Err(FetchError::Sink(err))) => return Err(FetchFailure::Sink(err)),
        Some(Err(FetchError::Store(err))) => err,
        None => StoreError::TimedOut {
            context: format!("fetching '{key}'"),
            elapsed: limit,
        },
    };

    debug!(
        "📥 fetch of '{key}' failed after {} bytes: {source_error}",
        writer.bytes()
    );
    writer.abandon().await.map_err(FetchFailure::Sink)?;
    Err(FetchFailure::Source(source_error))
}
