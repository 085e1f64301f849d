//! 🗜️ The Archive Encoder: a ZIP writer that never looks back.
//!
//! 🎬 *[INT. BYTE STREAM. the encoder writes a header, then data, then a receipt.]*
//! *[it cannot seek. it cannot rewind. it can only append, like a diary with a pen.]*
//!
//! A sequential, entry-oriented ZIP writer over a [`ByteSink`]. Because the sink is a
//! relay that has no concept of position, every entry is written the streaming way:
//! local header with zeroed sizes (flag bit 3), deflated data, then a data descriptor
//! with the real crc and sizes. The central directory at the end is the source of truth.
//!
//! 🧠 Knowledge graph:
//! - `open_entry(name)` → `write(bytes)`* → (`close_entry` | next `open_entry` | `finalize`)
//! - `abandon_entry()`: the entry's bytes are already downstream and cannot be recalled,
//!   so it is terminated and left out of the central directory. Readers that go through
//!   the directory (i.e. all of them that matter) never see it.
//! - `finalize()` writes the directory and end record exactly once. It does not close the sink.
//! - Deflate and CRC-32 come from `flate2`; compressed output is drained from an in-memory
//!   encoder after every write, so nothing larger than deflate's window piles up here.
//! - Cancel-safe: encoded bytes wait in `pending` and leave it one sink-sized put at a time.
//!   A caller that gives up mid-write (a fetch timeout, say) leaves the unsent tail queued,
//!   and the next operation sends it first. Offsets in the directory stay honest.

mod records;

use std::collections::HashSet;
use std::io::Write;

use async_trait::async_trait;
use flate2::{Compression, Crc, write::DeflateEncoder};
use thiserror::Error;
use tracing::{debug, trace};

use crate::relay::{RelayError, RelayWriter};
use records::{CentralRecord, DosTimestamp};

/// 💀 Encoder invariant violations and downstream failures. All fatal to a run.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("no archive entry is open")]
    NoOpenEntry,
    #[error("archive entry names must not be blank")]
    BlankEntryName,
    #[error("archive entry '{name}' was already written")]
    EntryReopened { name: String },
    #[error("archive entry name is {len} bytes; zip allows at most 65535")]
    NameTooLong { len: usize },
    #[error("archive has already been finalized")]
    AlreadyFinalized,
    #[error("deflate stream failed")]
    Compression(#[from] std::io::Error),
    #[error("archive sink failed")]
    Relay(#[from] RelayError),
}

/// 🚰 Where encoded archive bytes go. Append-only.
///
/// A `put` of at most `max_put()` bytes must be all-or-nothing if its future is dropped.
#[async_trait]
pub trait ByteSink: Send {
    async fn put(&mut self, bytes: &[u8]) -> Result<(), RelayError>;

    fn max_put(&self) -> usize {
        usize::MAX
    }
}

#[async_trait]
impl ByteSink for RelayWriter {
    async fn put(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        self.write(bytes).await
    }

    // -- one chunk = one channel send, and a dropped send delivers nothing
    fn max_put(&self) -> usize {
        self.chunk_bytes()
    }
}

#[async_trait]
impl ByteSink for Vec<u8> {
    async fn put(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// 📄 What one finished entry looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySummary {
    pub name: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub crc32: u32,
}

/// 📊 What the finished archive looked like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries: usize,
    pub bytes_written: u64,
}

struct OpenEntry {
    name: String,
    header_offset: u64,
    deflater: DeflateEncoder<Vec<u8>>,
    crc: Crc,
    uncompressed: u64,
    compressed: u64,
    /// Announced in the local header; the descriptor must then use 8-byte sizes.
    zip64: bool,
}

/// 🗜️ Streaming ZIP encoder. See the module docs for the lifecycle.
pub struct ZipEncoder<S> {
    sink: S,
    /// Bytes the sink has accepted.
    bytes_written: u64,
    /// Bytes encoded so far, sent or still pending. This is the archive offset.
    bytes_encoded: u64,
    pending: Vec<u8>,
    pending_pos: usize,
    open: Option<OpenEntry>,
    directory: Vec<CentralRecord>,
    seen_names: HashSet<String>,
    timestamp: DosTimestamp,
    finalized: bool,
}

impl<S> std::fmt::Debug for ZipEncoder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- the deflater doesn't do Debug and nobody wants to read its window anyway
        f.debug_struct("ZipEncoder")
            .field("bytes_written", &self.bytes_written)
            .field(
                "current_entry",
                &self.open.as_ref().map(|entry| entry.name.as_str()),
            )
            .field("entries", &self.directory.len())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl<S: ByteSink> ZipEncoder<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            bytes_written: 0,
            bytes_encoded: 0,
            pending: Vec::new(),
            pending_pos: 0,
            open: None,
            directory: Vec::new(),
            seen_names: HashSet::new(),
            timestamp: DosTimestamp::now(),
            finalized: false,
        }
    }

    /// 🏷️ Name of the entry currently accepting bytes.
    pub fn current_entry(&self) -> Option<&str> {
        self.open.as_ref().map(|entry| entry.name.as_str())
    }

    /// Cumulative bytes handed to the sink.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Entries that made it into the directory so far.
    pub fn entry_count(&self) -> usize {
        self.directory.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Queue bytes for the sink. No I/O; the next flush sends them.
    fn queue(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        self.bytes_encoded += bytes.len() as u64;
    }

    /// 🚚 Send whatever is queued, one all-or-nothing put at a time.
    async fn flush_pending(&mut self) -> Result<(), ArchiveError> {
        let max_put = self.sink.max_put().max(1);
        while self.pending_pos < self.pending.len() {
            let end = self.pending.len().min(self.pending_pos + max_put);
            self.sink.put(&self.pending[self.pending_pos..end]).await?;
            self.bytes_written += (end - self.pending_pos) as u64;
            self.pending_pos = end;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Ok(())
    }

    /// 📂 Start a new entry. An entry still open is closed first.
    pub async fn open_entry(&mut self, name: &str) -> Result<(), ArchiveError> {
        self.open_entry_sized(name, None).await
    }

    /// 📂 Same as [`ZipEncoder::open_entry`], with the expected source size when known.
    ///
    /// An entry expected near or past 4 GiB is written zip64 from its local header on.
    pub async fn open_entry_sized(
        &mut self,
        name: &str,
        size_hint: Option<u64>,
    ) -> Result<(), ArchiveError> {
        if self.finalized {
            return Err(ArchiveError::AlreadyFinalized);
        }
        if name.trim().is_empty() {
            return Err(ArchiveError::BlankEntryName);
        }
        if name.len() > u16::MAX as usize {
            return Err(ArchiveError::NameTooLong { len: name.len() });
        }
        if self.seen_names.contains(name) {
            return Err(ArchiveError::EntryReopened {
                name: name.to_string(),
            });
        }
        if self.open.is_some() {
            self.seal_entry()?;
        }

        let header_offset = self.bytes_encoded;
        let zip64 = size_hint.is_some_and(records::wants_zip64);
        let header = records::local_header(name, self.timestamp, zip64);
        self.queue(&header);
        self.seen_names.insert(name.to_string());
        self.open = Some(OpenEntry {
            name: name.to_string(),
            header_offset,
            deflater: DeflateEncoder::new(Vec::new(), Compression::default()),
            crc: Crc::new(),
            uncompressed: 0,
            compressed: 0,
            zip64,
        });
        trace!("📂 opened archive entry '{}' at offset {}", name, header_offset);
        self.flush_pending().await
    }

    /// ✍️ Append bytes to the open entry.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        let compressed = {
            let entry = self.open.as_mut().ok_or(ArchiveError::NoOpenEntry)?;
            entry.crc.update(bytes);
            entry.uncompressed += bytes.len() as u64;
            entry.deflater.write_all(bytes)?;
            let out = std::mem::take(entry.deflater.get_mut());
            entry.compressed += out.len() as u64;
            out
        };
        // -- an empty `compressed` still flushes: an interrupted tail may be waiting
        self.queue(&compressed);
        self.flush_pending().await
    }

    /// Finish the deflater and queue the descriptor. Shared by close and abandon.
    fn terminate_open_entry(&mut self) -> Result<(OpenEntry, u32), ArchiveError> {
        let mut entry = self.open.take().ok_or(ArchiveError::NoOpenEntry)?;
        let deflater = std::mem::replace(
            &mut entry.deflater,
            DeflateEncoder::new(Vec::new(), Compression::none()),
        );
        let tail = deflater.finish()?;
        entry.compressed += tail.len() as u64;
        self.queue(&tail);
        let crc32 = entry.crc.sum();
        let descriptor = records::data_descriptor(
            crc32,
            entry.compressed,
            entry.uncompressed,
            entry.zip64,
        );
        self.queue(&descriptor);
        Ok((entry, crc32))
    }

    /// Terminate the open entry and record it in the directory, without sending anything yet.
    fn seal_entry(&mut self) -> Result<EntrySummary, ArchiveError> {
        let (entry, crc32) = self.terminate_open_entry()?;
        self.directory.push(CentralRecord {
            name: entry.name.clone(),
            crc32,
            compressed_size: entry.compressed,
            uncompressed_size: entry.uncompressed,
            header_offset: entry.header_offset,
            timestamp: self.timestamp,
        });
        trace!(
            "✅ closed archive entry '{}' ({} -> {} bytes)",
            entry.name, entry.uncompressed, entry.compressed
        );
        Ok(EntrySummary {
            name: entry.name,
            uncompressed_size: entry.uncompressed,
            compressed_size: entry.compressed,
            crc32,
        })
    }

    /// ✅ Finish the open entry and record it in the directory.
    pub async fn close_entry(&mut self) -> Result<EntrySummary, ArchiveError> {
        let summary = self.seal_entry()?;
        self.flush_pending().await?;
        Ok(summary)
    }

    /// 🗑️ Terminate the open entry and leave it out of the directory.
    pub async fn abandon_entry(&mut self) -> Result<(), ArchiveError> {
        let (entry, _) = self.terminate_open_entry()?;
        debug!(
            "🗑️ abandoned archive entry '{}' after {} bytes; it will not be listed",
            entry.name, entry.uncompressed
        );
        self.flush_pending().await
    }

    /// 🏁 Close any open entry, write the central directory and end record. Once.
    pub async fn finalize(&mut self) -> Result<ArchiveStats, ArchiveError> {
        if self.finalized {
            return Err(ArchiveError::AlreadyFinalized);
        }
        if self.open.is_some() {
            self.seal_entry()?;
        }

        let cd_offset = self.bytes_encoded;
        let mut directory = Vec::new();
        for record in &self.directory {
            directory.extend_from_slice(&records::central_header(record));
        }
        let cd_size = directory.len() as u64;
        let end = records::end_of_central_directory(
            self.directory.len() as u64,
            cd_offset,
            cd_size,
        );
        self.queue(&directory);
        self.queue(&end);
        self.finalized = true;
        self.flush_pending().await?;

        let stats = ArchiveStats {
            entries: self.directory.len(),
            bytes_written: self.bytes_written,
        };
        debug!(
            "🏁 archive finalized: {} entries, {} bytes",
            stats.entries, stats.bytes_written
        );
        Ok(stats)
    }
}
