//! 🧱 ZIP record layouts, byte by little-endian byte.
//!
//! Everything here is pure: structs in, `Vec<u8>` out. The encoder decides when to write
//! what; this file only knows how each record is spelled (APPNOTE 6.3.x).

use chrono::{Datelike, NaiveDateTime, Timelike};

pub(crate) const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
pub(crate) const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
pub(crate) const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
pub(crate) const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
pub(crate) const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
pub(crate) const EOCD_SIG: u32 = 0x0605_4b50;

const VERSION_DEFAULT: u16 = 20;
const VERSION_ZIP64: u16 = 45;
// -- upper byte 3 = "made on unix", so the external attrs below mean rw-r--r--
const MADE_BY_UNIX: u16 = 3 << 8;
const UNIX_REGULAR_FILE_0644: u32 = 0o100_644 << 16;

/// bit 3: sizes + crc live in a data descriptor after the data. bit 11: names are UTF-8.
pub(crate) const FLAGS: u16 = (1 << 3) | (1 << 11);
pub(crate) const METHOD_DEFLATE: u16 = 8;

const ZIP64_EXTRA_TAG: u16 = 0x0001;
const U32_LIMIT: u64 = u32::MAX as u64;

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// 🕰️ MS-DOS date + time, two seconds of resolution, years 1980..=2107.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DosTimestamp {
    pub time: u16,
    pub date: u16,
}

impl DosTimestamp {
    pub(crate) fn from_datetime(dt: NaiveDateTime) -> Self {
        let year = dt.year().clamp(1980, 2107) as u16;
        let date = ((year - 1980) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
        let time =
            ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
        Self { time, date }
    }

    pub(crate) fn now() -> Self {
        Self::from_datetime(chrono::Local::now().naive_local())
    }
}

/// 📇 Everything the central directory needs to remember about a finished entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CentralRecord {
    pub name: String,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub header_offset: u64,
    pub timestamp: DosTimestamp,
}

impl CentralRecord {
    pub(crate) fn needs_zip64(&self) -> bool {
        self.compressed_size >= U32_LIMIT
            || self.uncompressed_size >= U32_LIMIT
            || self.header_offset >= U32_LIMIT
    }
}

/// Sizes at or past this are written zip64 from the local header on. Deflate can grow
/// incompressible input a little, so the cut sits a bit below the 32-bit limit.
const ZIP64_HINT_THRESHOLD: u64 = U32_LIMIT - (U32_LIMIT >> 6);

/// 📏 Should an entry of (roughly) this many source bytes announce zip64 up front?
pub(crate) fn wants_zip64(size_hint: u64) -> bool {
    size_hint >= ZIP64_HINT_THRESHOLD
}

/// Local file header. Sizes and crc are zero: they follow the data in a descriptor.
///
/// A zip64 header carries version 45 and a zeroed zip64 extra field, which tells
/// streaming readers that the descriptor behind the data has 8-byte sizes.
pub(crate) fn local_header(name: &str, timestamp: DosTimestamp, zip64: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(30 + name.len() + 20);
    put_u32(&mut buf, LOCAL_HEADER_SIG);
    put_u16(&mut buf, if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT });
    put_u16(&mut buf, FLAGS);
    put_u16(&mut buf, METHOD_DEFLATE);
    put_u16(&mut buf, timestamp.time);
    put_u16(&mut buf, timestamp.date);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    put_u16(&mut buf, name.len() as u16);
    put_u16(&mut buf, if zip64 { 20 } else { 0 });
    buf.extend_from_slice(name.as_bytes());
    if zip64 {
        put_u16(&mut buf, ZIP64_EXTRA_TAG);
        put_u16(&mut buf, 16);
        put_u64(&mut buf, 0);
        put_u64(&mut buf, 0);
    }
    buf
}

/// Data descriptor. 8-byte sizes when the local header announced zip64, or when
/// either size overflows 32 bits anyway.
pub(crate) fn data_descriptor(
    crc32: u32,
    compressed: u64,
    uncompressed: u64,
    zip64: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    put_u32(&mut buf, DATA_DESCRIPTOR_SIG);
    put_u32(&mut buf, crc32);
    if zip64 || compressed >= U32_LIMIT || uncompressed >= U32_LIMIT {
        put_u64(&mut buf, compressed);
        put_u64(&mut buf, uncompressed);
    } else {
        put_u32(&mut buf, compressed as u32);
        put_u32(&mut buf, uncompressed as u32);
    }
    buf
}

pub(crate) fn central_header(record: &CentralRecord) -> Vec<u8> {
    let zip64 = record.needs_zip64();
    let version = if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT };
    let mut buf = Vec::with_capacity(46 + record.name.len() + 28);
    put_u32(&mut buf, CENTRAL_HEADER_SIG);
    put_u16(&mut buf, MADE_BY_UNIX | version);
    put_u16(&mut buf, version);
    put_u16(&mut buf, FLAGS);
    put_u16(&mut buf, METHOD_DEFLATE);
    put_u16(&mut buf, record.timestamp.time);
    put_u16(&mut buf, record.timestamp.date);
    put_u32(&mut buf, record.crc32);
    if zip64 {
        // -- 🚩 all three maxed out; the real values ride in the zip64 extra field
        put_u32(&mut buf, u32::MAX);
        put_u32(&mut buf, u32::MAX);
    } else {
        put_u32(&mut buf, record.compressed_size as u32);
        put_u32(&mut buf, record.uncompressed_size as u32);
    }
    put_u16(&mut buf, record.name.len() as u16);
    put_u16(&mut buf, if zip64 { 28 } else { 0 });
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u32(&mut buf, UNIX_REGULAR_FILE_0644);
    put_u32(
        &mut buf,
        if zip64 {
            u32::MAX
        } else {
            record.header_offset as u32
        },
    );
    buf.extend_from_slice(record.name.as_bytes());
    if zip64 {
        put_u16(&mut buf, ZIP64_EXTRA_TAG);
        put_u16(&mut buf, 24);
        put_u64(&mut buf, record.uncompressed_size);
        put_u64(&mut buf, record.compressed_size);
        put_u64(&mut buf, record.header_offset);
    }
    buf
}

/// 🏁 End-of-central-directory, preceded by the zip64 record + locator when the
/// entry count, directory size or directory offset outgrow the classic fields.
///
/// `cd_offset` is where the central directory starts; `cd_size` is its length.
pub(crate) fn end_of_central_directory(entries: u64, cd_offset: u64, cd_size: u64) -> Vec<u8> {
    let zip64 = entries >= u16::MAX as u64 || cd_size >= U32_LIMIT || cd_offset >= U32_LIMIT;
    let mut buf = Vec::with_capacity(22 + 56 + 20);
    if zip64 {
        let zip64_eocd_offset = cd_offset + cd_size;
        put_u32(&mut buf, ZIP64_EOCD_SIG);
        put_u64(&mut buf, 44);
        put_u16(&mut buf, MADE_BY_UNIX | VERSION_ZIP64);
        put_u16(&mut buf, VERSION_ZIP64);
        put_u32(&mut buf, 0);
        put_u32(&mut buf, 0);
        put_u64(&mut buf, entries);
        put_u64(&mut buf, entries);
        put_u64(&mut buf, cd_size);
        put_u64(&mut buf, cd_offset);

        put_u32(&mut buf, ZIP64_LOCATOR_SIG);
        put_u32(&mut buf, 0);
        put_u64(&mut buf, zip64_eocd_offset);
        put_u32(&mut buf, 1);
    }
    let capped_entries = entries.min(u16::MAX as u64) as u16;
    put_u32(&mut buf, EOCD_SIG);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, capped_entries);
    put_u16(&mut buf, capped_entries);
    put_u32(&mut buf, cd_size.min(U32_LIMIT) as u32);
    put_u32(&mut buf, cd_offset.min(U32_LIMIT) as u32);
    put_u16(&mut buf, 0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn u16_at(buf: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([buf[at], buf[at + 1]])
    }

    fn u32_at(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    fn u64_at(buf: &[u8], at: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[at..at + 8]);
        u64::from_le_bytes(raw)
    }

    fn stamp() -> DosTimestamp {
        DosTimestamp { time: 0, date: 0x21 }
    }

    #[test]
    fn the_one_where_dos_time_lands_on_the_right_bits() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 15)
            .and_then(|d| d.and_hms_opt(13, 45, 31))
            .expect("valid datetime");
        let dos = DosTimestamp::from_datetime(dt);
        assert_eq!(dos.date, ((2024 - 1980) << 9) | (3 << 5) | 15);
        // -- ⏱️ 31 seconds rounds down to 15 two-second ticks. DOS never had time for odd seconds.
        assert_eq!(dos.time, (13 << 11) | (45 << 5) | 15);
    }

    #[test]
    fn the_one_where_the_stone_age_is_clamped_to_1980() {
        let dt = NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid datetime");
        assert_eq!(DosTimestamp::from_datetime(dt).date >> 9, 0);
    }

    #[test]
    fn the_one_where_the_local_header_promises_a_descriptor() {
        let header = local_header("dir/a.txt", stamp(), false);
        assert_eq!(u32_at(&header, 0), LOCAL_HEADER_SIG);
        assert_eq!(u16_at(&header, 4), VERSION_DEFAULT);
        assert_eq!(u16_at(&header, 6) & (1 << 3), 1 << 3);
        assert_eq!(u32_at(&header, 14), 0);
        assert_eq!(u16_at(&header, 26), 9);
        assert_eq!(u16_at(&header, 28), 0);
        assert_eq!(&header[30..], b"dir/a.txt");
    }

    #[test]
    fn the_one_where_a_big_entry_says_zip64_before_its_first_byte() {
        let header = local_header("big.bin", stamp(), true);
        assert_eq!(u16_at(&header, 4), VERSION_ZIP64);
        assert_eq!(u16_at(&header, 28), 20);
        assert_eq!(header.len(), 30 + 7 + 20);
        let extra = 30 + 7;
        assert_eq!(u16_at(&header, extra), ZIP64_EXTRA_TAG);
        assert_eq!(u16_at(&header, extra + 2), 16);
        assert_eq!(u64_at(&header, extra + 4), 0);
        assert_eq!(u64_at(&header, extra + 12), 0);
    }

    #[test]
    fn the_one_where_the_zip64_cut_sits_just_under_four_gigs() {
        assert!(!wants_zip64(1024));
        assert!(!wants_zip64(4_000_000_000));
        assert!(wants_zip64(u32::MAX as u64 - 1));
        assert!(wants_zip64(5 * 1024 * 1024 * 1024));
    }

    #[test]
    fn the_one_where_small_descriptors_stay_small_and_big_ones_grow() {
        assert_eq!(data_descriptor(1, 2, 3, false).len(), 16);
        let big = data_descriptor(1, 2, 5 * 1024 * 1024 * 1024, false);
        assert_eq!(big.len(), 24);
        assert_eq!(u64_at(&big, 16), 5 * 1024 * 1024 * 1024);
        // -- announced zip64 in the local header, so the descriptor keeps its promise
        let promised = data_descriptor(1, 2, 3, true);
        assert_eq!(promised.len(), 24);
        assert_eq!(u64_at(&promised, 8), 2);
        assert_eq!(u64_at(&promised, 16), 3);
    }

    #[test]
    fn the_one_where_a_huge_entry_gets_a_zip64_extra_field() {
        let record = CentralRecord {
            name: "big.bin".to_string(),
            crc32: 0xdead_beef,
            compressed_size: 6_000_000_000,
            uncompressed_size: 7_000_000_000,
            header_offset: 12,
            timestamp: stamp(),
        };
        assert!(record.needs_zip64());
        let buf = central_header(&record);
        assert_eq!(u32_at(&buf, 20), u32::MAX);
        assert_eq!(u32_at(&buf, 24), u32::MAX);
        assert_eq!(u16_at(&buf, 30), 28);
        assert_eq!(u32_at(&buf, 42), u32::MAX);
        let extra = 46 + record.name.len();
        assert_eq!(u16_at(&buf, extra), ZIP64_EXTRA_TAG);
        assert_eq!(u64_at(&buf, extra + 4), 7_000_000_000);
        assert_eq!(u64_at(&buf, extra + 12), 6_000_000_000);
        assert_eq!(u64_at(&buf, extra + 20), 12);
    }

    #[test]
    fn the_one_where_the_end_record_goes_zip64_only_when_it_must() {
        assert_eq!(end_of_central_directory(3, 100, 50).len(), 22);
        let big = end_of_central_directory(70_000, 100, 50);
        assert_eq!(big.len(), 56 + 20 + 22);
        assert_eq!(u32_at(&big, 0), ZIP64_EOCD_SIG);
        assert_eq!(u32_at(&big, 56), ZIP64_LOCATOR_SIG);
        assert_eq!(u64_at(&big, 64), 150);
        assert_eq!(u16_at(&big, 76 + 8), u16::MAX);
    }
}
