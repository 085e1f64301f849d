//! 📊 Progress reporting. The producer talks, the terminal listens.
//!
//! 🚀 The producer calls [`ProgressSink::on_item`] once per attempted key, in order,
//! with a 1-based index over the non-blank keys. That index only ever goes up.
//! [`ProgressSink::on_finish`] fires once at the end with the summary.
//!
//! 🧠 Knowledge graph:
//! - [`ProgressMetrics`]: indicatif bar + comfy-table message. Counters are atomics, so the
//!   bar can be shared with whoever else wants to peek while the producer runs.
//! - [`NoProgress`]: for `--no-progress`, `--json` and tests that value silence.
//!
//! ⚠️  Warning: Watching this progress bar will not make it go faster. Science says no.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

use crate::job::{RunSummary, TransferOutcome, TransferStatus};

// -- 📏 mebibyte. base two, as the disk gods intended.
const MIB: u64 = 1024 * 1024;

/// 📡 Per-item completion signal, plus one final word.
pub trait ProgressSink: Send + Sync {
    fn on_item(&self, index: usize, total: usize, outcome: &TransferOutcome);

    fn on_finish(&self, _summary: &RunSummary) {}
}

/// 🤫 Says nothing. Sees nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_item(&self, _index: usize, _total: usize, _outcome: &TransferOutcome) {}
}

/// 📦 Raw bytes → something a human can read. "1073741824 bytes" is a war crime in a UI.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} bytes")
    }
}

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS if you should probably call your mom. It's been a while.
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📊 The terminal progress display for one run.
///
/// # Ancient Proverb
/// "He who zips a prefix without a progress bar, zips alone and in darkness."
pub struct ProgressMetrics {
    label: String,
    progress_bar: ProgressBar,
    transferred: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    bytes: AtomicU64,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("transferred", &self.transferred.load(Ordering::Relaxed))
            .field("skipped", &self.skipped.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .field("bytes", &self.bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 `total` is the number of keys that will be attempted (blanks excluded).
    pub fn new(label: impl Into<String>, total: usize) -> Self {
        let progress_bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        progress_bar.set_style(style);

        Self {
            label: label.into(),
            progress_bar,
            transferred: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn transferred(&self) -> usize {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// 🎨 The table under the bar.
    ///
    /// ```text
    /// s3://bucket/prefix → archive.zip
    ///   <transferred>   <skipped>   <failed>
    ///   <bytes>         <MiB/s>     <elapsed>
    /// ```
    fn render(&self) -> String {
        let elapsed = self.start_time.elapsed();
        let bytes = self.bytes();
        let mib_per_sec = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 / MIB as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} transferred", format_number(self.transferred() as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} skipped", format_number(self.skipped() as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} failed", format_number(self.failed() as u64)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format_bytes(bytes)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{mib_per_sec:.2} MiB/s")).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} elapsed", format_duration(elapsed)))
                .set_alignment(CellAlignment::Right),
        ]);
        format!("{}\n{}", self.label, table)
    }
}

impl ProgressSink for ProgressMetrics {
    fn on_item(&self, index: usize, _total: usize, outcome: &TransferOutcome) {
        match outcome.status {
            TransferStatus::Transferred => {
                self.transferred.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(outcome.bytes, Ordering::Relaxed);
            }
            TransferStatus::SkippedMissing => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            TransferStatus::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            TransferStatus::SkippedBlank => {}
        }
        self.progress_bar.set_message(self.render());
        self.progress_bar.set_position(index as u64);
    }

    fn on_finish(&self, _summary: &RunSummary) {
        self.progress_bar.set_message(self.render());
        self.progress_bar.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_bytes_pick_their_own_units() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(3 * MIB), "3.00 MiB");
    }

    #[test]
    fn the_one_where_big_numbers_get_commas() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn the_one_where_long_runs_grow_an_hours_column() {
        assert_eq!(format_duration(Duration::from_secs(65)), "01:05");
        assert_eq!(format_duration(Duration::from_secs(3_661)), "01:01:01");
    }

    #[test]
    fn the_one_where_the_counters_follow_the_outcomes() {
        let metrics = ProgressMetrics::new("test", 3);
        metrics.on_item(1, 3, &TransferOutcome::transferred("a", 10));
        metrics.on_item(2, 3, &TransferOutcome::skipped_missing("b", "gone"));
        metrics.on_item(3, 3, &TransferOutcome::failed("c", "reset"));
        metrics.on_finish(&RunSummary::new("out.zip"));

        assert_eq!(metrics.transferred(), 1);
        assert_eq!(metrics.skipped(), 1);
        assert_eq!(metrics.failed(), 1);
        assert_eq!(metrics.bytes(), 10);
        assert!(metrics.render().contains("1 transferred"));
    }
}
