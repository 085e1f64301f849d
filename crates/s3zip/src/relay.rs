//! 🚰 The Relay: one pipe, two ends, zero local disk.
//!
//! 🎬 *[a zip encoder stands at one end of a narrow hallway. an uploader waits at the other.]*
//! *["after you," says the encoder. "no, after YOU," says the uploader. the hallway holds four chunks.]*
//!
//! A bounded, single-writer/single-reader byte channel. The writer hands bytes over in
//! chunks of at most `chunk_bytes`; the channel holds at most `capacity_bytes / chunk_bytes`
//! chunks. When it is full, `write` parks until the reader drains a slot. That parking is
//! the whole backpressure story: the archive can never run further ahead of the upload
//! than `capacity_bytes`, however big the archive gets.
//!
//! 🧠 Knowledge graph:
//! - Built on `async_channel::bounded`, same as the worker channels everywhere else.
//! - `close()` seals the stream. Dropping the writer WITHOUT `close()` is an abort,
//!   and the reader reports [`RelayError::WriterAborted`] instead of a clean EOF.
//!   An uploader must never finish an object from a stream that was not sealed.
//! - The gauge (`buffered_bytes` / `peak_buffered_bytes`) exists so tests can prove the
//!   bounded-memory property instead of just believing it. 🦆

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

use async_channel::{Receiver, Sender};
use thiserror::Error;
use tracing::{debug, trace};

/// 💀 Everything that can go wrong on either end of the pipe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Write attempted after `close()`, or the reader is gone.
    #[error("relay is closed; the write side has been sealed or the reader has left")]
    Closed,
    /// The writer went away without sealing the stream.
    #[error("relay writer dropped without closing; the stream is incomplete")]
    WriterAborted,
}

/// 🔧 Sizing for a relay. Both values are bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Upper bound on bytes sitting in the channel at any instant.
    pub capacity_bytes: usize,
    /// Largest single chunk handed across. Writes bigger than this are split.
    pub chunk_bytes: usize,
}

impl RelayConfig {
    pub fn new(capacity_bytes: usize, chunk_bytes: usize) -> Self {
        // -- 🔒 a chunk can't be bigger than the hallway, and a hallway of zero is a wall
        let capacity_bytes = capacity_bytes.max(1);
        let chunk_bytes = chunk_bytes.clamp(1, capacity_bytes);
        Self {
            capacity_bytes,
            chunk_bytes,
        }
    }

    /// 📏 How many chunks fit in the channel. Always at least one.
    pub fn slots(&self) -> usize {
        (self.capacity_bytes / self.chunk_bytes.max(1)).max(1)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        // -- 📦 1 MiB in flight, 64 KiB at a time. sixteen chunks in the hallway.
        Self::new(1024 * 1024, 64 * 1024)
    }
}

/// 📊 Shared occupancy counters. Written by both ends, read by anyone.
#[derive(Debug, Default)]
struct RelayGauge {
    // -- signed: a receive can be booked a hair before its matching send
    buffered: AtomicIsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl RelayGauge {
    fn on_sent(&self, n: usize) {
        let n = n as isize;
        let now = self.buffered.fetch_add(n, Ordering::AcqRel) + n;
        self.peak.fetch_max(now.max(0) as usize, Ordering::AcqRel);
        self.total.fetch_add(n as usize, Ordering::AcqRel);
    }

    fn on_received(&self, n: usize) {
        self.buffered.fetch_sub(n as isize, Ordering::AcqRel);
    }
}

/// 🔭 A read-only window onto a relay's occupancy, cheap to clone.
#[derive(Debug, Clone)]
pub struct RelayStats {
    gauge: Arc<RelayGauge>,
    config: RelayConfig,
}

impl RelayStats {
    pub fn buffered_bytes(&self) -> usize {
        self.gauge.buffered.load(Ordering::Acquire).max(0) as usize
    }

    /// 🏔️ High-water mark of bytes buffered in the channel over the relay's life.
    pub fn peak_buffered_bytes(&self) -> usize {
        self.gauge.peak.load(Ordering::Acquire)
    }

    /// Total bytes the writer has handed over.
    pub fn total_bytes(&self) -> usize {
        self.gauge.total.load(Ordering::Acquire)
    }

    pub fn config(&self) -> RelayConfig {
        self.config
    }
}

/// ✍️ The write end. Exactly one exists per relay.
#[derive(Debug)]
pub struct RelayWriter {
    tx: Sender<Vec<u8>>,
    sealed: Arc<AtomicBool>,
    gauge: Arc<RelayGauge>,
    chunk_bytes: usize,
}

/// 📖 The read end. Exactly one exists per relay.
#[derive(Debug)]
pub struct RelayReader {
    rx: Receiver<Vec<u8>>,
    sealed: Arc<AtomicBool>,
    gauge: Arc<RelayGauge>,
    // -- the tail of a chunk that didn't fit in the caller's buffer last time
    pending: Vec<u8>,
    pending_pos: usize,
    finished: bool,
}

/// 🏗️ Build a fresh relay. Hands back both ends plus a stats window.
pub fn relay(config: RelayConfig) -> (RelayWriter, RelayReader, RelayStats) {
    let config = RelayConfig::new(config.capacity_bytes, config.chunk_bytes);
    let (tx, rx) = async_channel::bounded(config.slots());
    let sealed = Arc::new(AtomicBool::new(false));
    let gauge = Arc::new(RelayGauge::default());
    debug!(
        "🚰 relay built: {} slots x {} bytes",
        config.slots(),
        config.chunk_bytes
    );
    (
        RelayWriter {
            tx,
            sealed: Arc::clone(&sealed),
            gauge: Arc::clone(&gauge),
            chunk_bytes: config.chunk_bytes,
        },
        RelayReader {
            rx,
            sealed,
            gauge: Arc::clone(&gauge),
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        },
        RelayStats { gauge, config },
    )
}

impl RelayWriter {
    /// 📤 Hand `bytes` to the reader. Parks while the channel is full.
    ///
    /// Returns once every byte is either consumed or sitting in a channel slot.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        for chunk in bytes.chunks(self.chunk_bytes) {
            let n = chunk.len();
            self.tx
                .send(chunk.to_vec())
                .await
                .map_err(|_| RelayError::Closed)?;
            self.gauge.on_sent(n);
            trace!("📤 relay accepted {} bytes", n);
        }
        Ok(())
    }

    /// 🔒 Seal the stream. Safe to call any number of times; only the first does anything.
    pub fn close(&mut self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            self.tx.close();
            debug!("🔒 relay sealed by writer");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sealed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    /// Largest piece a single channel send carries.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }
}

impl RelayReader {
    /// 📥 Next whole chunk, or `None` at end-of-stream.
    ///
    /// After the first `None`, every later call is `None` too.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, RelayError> {
        if self.pending_pos < self.pending.len() {
            let rest = self.pending.split_off(self.pending_pos);
            self.pending.clear();
            self.pending_pos = 0;
            return Ok(Some(rest));
        }
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Ok(chunk) => {
                self.gauge.on_received(chunk.len());
                Ok(Some(chunk))
            }
            Err(_) => {
                // -- channel drained and closed. sealed = clean EOF, otherwise someone bailed.
                if self.sealed.load(Ordering::Acquire) {
                    self.finished = true;
                    trace!("🏁 relay reader observed end-of-stream");
                    Ok(None)
                } else {
                    Err(RelayError::WriterAborted)
                }
            }
        }
    }

    /// 📥 Fill `buf` with up to `buf.len()` bytes. `Ok(0)` means end-of-stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending_pos >= self.pending.len() {
            match self.read_chunk().await? {
                Some(chunk) => {
                    self.pending = chunk;
                    self.pending_pos = 0;
                }
                None => return Ok(0),
            }
        }
        let available = &self.pending[self.pending_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_pos += n;
        Ok(n)
    }

    /// 🧹 Throw away everything until end-of-stream. Returns bytes discarded.
    ///
    /// Used when the consumer has already failed but the producer must still be
    /// allowed to finish its pass.
    pub async fn drain(&mut self) -> Result<u64, RelayError> {
        let mut discarded = 0u64;
        while let Some(chunk) = self.read_chunk().await? {
            discarded += chunk.len() as u64;
        }
        Ok(discarded)
    }

    /// True once end-of-stream has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn the_one_where_bytes_come_out_in_the_order_they_went_in() {
        let (mut writer, mut reader, _stats) = relay(RelayConfig::new(16, 4));
        let producer = tokio::spawn(async move {
            writer.write(b"hello ").await.expect("write 1");
            writer.write(b"relay world").await.expect("write 2");
            writer.close();
        });

        let mut collected = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        producer.await.expect("producer task");
        assert_eq!(collected, b"hello relay world");
    }

    #[tokio::test]
    async fn the_one_where_closing_twice_still_means_one_ending() {
        let (mut writer, mut reader, _stats) = relay(RelayConfig::new(8, 8));
        writer.write(b"abc").await.expect("write");
        writer.close();
        writer.close();
        assert!(writer.is_closed());

        assert_eq!(reader.read_chunk().await, Ok(Some(b"abc".to_vec())));
        assert_eq!(reader.read_chunk().await, Ok(None));
        // -- 🔁 and it keeps saying "done" without inventing a second ending
        assert_eq!(reader.read_chunk().await, Ok(None));
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await, Ok(0));
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn the_one_where_writing_after_close_is_refused() {
        let (mut writer, _reader, _stats) = relay(RelayConfig::default());
        writer.close();
        assert_eq!(writer.write(b"late").await, Err(RelayError::Closed));
    }

    #[tokio::test]
    async fn the_one_where_a_vanished_writer_is_not_mistaken_for_eof() {
        let (mut writer, mut reader, _stats) = relay(RelayConfig::new(8, 4));
        writer.write(b"part").await.expect("write");
        drop(writer);

        assert_eq!(reader.read_chunk().await, Ok(Some(b"part".to_vec())));
        assert_eq!(reader.read_chunk().await, Err(RelayError::WriterAborted));
    }

    #[tokio::test]
    async fn the_one_where_a_vanished_reader_fails_the_writer() {
        let (mut writer, reader, _stats) = relay(RelayConfig::new(4, 4));
        drop(reader);
        assert_eq!(writer.write(b"nobody home").await, Err(RelayError::Closed));
    }

    #[tokio::test]
    async fn the_one_where_a_slow_reader_keeps_the_buffer_bounded() {
        let config = RelayConfig::new(64, 16);
        let (mut writer, mut reader, stats) = relay(config);

        let producer = tokio::spawn(async move {
            let payload = vec![7u8; 4096];
            writer.write(&payload).await.expect("write");
            writer.close();
        });

        let mut seen = 0usize;
        while let Some(chunk) = reader.read_chunk().await.expect("read") {
            seen += chunk.len();
            // -- 🐢 dawdle so the writer slams into the capacity ceiling
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        producer.await.expect("producer task");

        assert_eq!(seen, 4096);
        assert_eq!(stats.total_bytes(), 4096);
        assert!(
            stats.peak_buffered_bytes() <= config.capacity_bytes,
            "peak {} exceeded capacity {}",
            stats.peak_buffered_bytes(),
            config.capacity_bytes
        );
    }

    #[tokio::test]
    async fn the_one_where_drain_swallows_the_rest_and_unblocks_the_writer() {
        let (mut writer, mut reader, _stats) = relay(RelayConfig::new(4, 4));
        let producer = tokio::spawn(async move {
            writer.write(&[1u8; 100]).await.expect("write");
            writer.close();
        });
        assert_eq!(reader.drain().await, Ok(100));
        producer.await.expect("producer task");
    }

    #[test]
    fn the_one_where_config_refuses_chunks_bigger_than_the_hallway() {
        let config = RelayConfig::new(10, 64);
        assert_eq!(config.chunk_bytes, 10);
        assert_eq!(config.slots(), 1);
        let zero = RelayConfig::new(0, 0);
        assert_eq!(zero.capacity_bytes, 1);
        assert_eq!(zero.chunk_bytes, 1);
    }
}
