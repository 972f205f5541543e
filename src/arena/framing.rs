#![forbid(unsafe_code)]
//! WAL-style framing for persistent segments.
//!
//! Commits on persistent repositories append a transaction frame to the
//! arena: a 32-byte transaction header, one 8-byte record header per record
//! followed by the record bytes, and an 8-byte end marker. Frame bytes are
//! a logical stream: when a segment runs out of space mid-frame the stream
//! seals it and resumes in the next segment behind a 16-byte continuation
//! marker. A 64-bit xxh64 checksum accumulated over the record bytes is
//! stamped into the transaction header and verified on recovery.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::arena::{Segment, SegmentStore, StoreMode};
use crate::error::{Result, WraithError};

const TAG_SEGMENT: u8 = 0xA1;
const TAG_TXN: u8 = 0xA2;
const TAG_CONTINUATION: u8 = 0xA3;
const TAG_END: u8 = 0xA4;
const TAG_FOOTER: u8 = 0xA5;

const META_MAGIC: [u8; 4] = *b"WRME";
const META_VERSION: u16 = 1;
const META_FILE: &str = "wraith.meta";

/// Sentinel segment id meaning "no previous frame".
pub const NO_FRAME: u32 = u32::MAX;

/// On-disk prefix of every persistent segment file.
#[derive(Clone, Copy, Debug)]
pub struct SegmentHeader {
    /// Store mode the segment was created under.
    pub mode: StoreMode,
    /// Segment ordinal within the store.
    pub segment_id: u32,
    /// Data capacity in bytes.
    pub capacity: u32,
    /// Last durably recorded head position.
    pub head: u32,
}

impl SegmentHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Encodes the header.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = TAG_SEGMENT;
        buf[1] = self.mode as u8;
        buf[4..8].copy_from_slice(&self.segment_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.capacity.to_be_bytes());
        buf[12..16].copy_from_slice(&self.head.to_be_bytes());
        buf
    }

    /// Decodes and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("segment header truncated"));
        }
        if src[0] != TAG_SEGMENT {
            return Err(WraithError::Corruption("segment header tag mismatch"));
        }
        let mode = StoreMode::from_raw(src[1])?;
        let segment_id = u32::from_be_bytes(src[4..8].try_into().expect("slice is 4 bytes"));
        let capacity = u32::from_be_bytes(src[8..12].try_into().expect("slice is 4 bytes"));
        let head = u32::from_be_bytes(src[12..16].try_into().expect("slice is 4 bytes"));
        Ok(Self {
            mode,
            segment_id,
            capacity,
            head,
        })
    }
}

/// 32-byte header opening a transaction frame.
#[derive(Clone, Copy, Debug)]
pub struct TxnHeader {
    /// Store mode of the writing repository.
    pub origin: StoreMode,
    /// Segment of the previous frame, or [`NO_FRAME`].
    pub prev_segment: u32,
    /// Offset of the previous frame within its segment.
    pub prev_offset: u32,
    /// Total record payload bytes in this frame.
    pub size: u32,
    /// Committing transaction id.
    pub txn_id: u64,
    /// xxh64 over the record payload bytes, seeded with the repository
    /// salt.
    pub checksum: u64,
}

impl TxnHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 32;

    /// Encodes the header.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = TAG_TXN;
        buf[1] = self.origin as u8;
        buf[4..8].copy_from_slice(&self.prev_offset.to_be_bytes());
        buf[8..12].copy_from_slice(&self.prev_segment.to_be_bytes());
        buf[12..16].copy_from_slice(&self.size.to_be_bytes());
        buf[16..24].copy_from_slice(&self.txn_id.to_be_bytes());
        buf[24..32].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Decodes and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("transaction header truncated"));
        }
        if src[0] != TAG_TXN {
            return Err(WraithError::Corruption("transaction header tag mismatch"));
        }
        let origin = StoreMode::from_raw(src[1])?;
        let prev_offset = u32::from_be_bytes(src[4..8].try_into().expect("slice is 4 bytes"));
        let prev_segment = u32::from_be_bytes(src[8..12].try_into().expect("slice is 4 bytes"));
        let size = u32::from_be_bytes(src[12..16].try_into().expect("slice is 4 bytes"));
        let txn_id = u64::from_be_bytes(src[16..24].try_into().expect("slice is 8 bytes"));
        let checksum = u64::from_be_bytes(src[24..32].try_into().expect("slice is 8 bytes"));
        Ok(Self {
            origin,
            prev_segment,
            prev_offset,
            size,
            txn_id,
            checksum,
        })
    }
}

/// 8-byte prefix of every record inside a frame.
#[derive(Clone, Copy, Debug)]
pub struct RecordHeader {
    /// Record payload length in bytes.
    pub len: u32,
}

impl RecordHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Encodes the header.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    /// Decodes a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("record header truncated"));
        }
        let len = u32::from_be_bytes(src[0..4].try_into().expect("slice is 4 bytes"));
        Ok(Self { len })
    }
}

/// 16-byte marker at the start of a segment that continues an in-flight
/// frame from the previous segment.
#[derive(Clone, Copy, Debug)]
pub struct TxnContinuation {
    /// Segment the frame stream arrived from.
    pub from_segment: u32,
    /// Stream bytes still outstanding after this marker.
    pub remaining: u32,
}

impl TxnContinuation {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Encodes the marker.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = TAG_CONTINUATION;
        buf[4..8].copy_from_slice(&self.from_segment.to_be_bytes());
        buf[8..12].copy_from_slice(&self.remaining.to_be_bytes());
        buf
    }

    /// Decodes and validates a marker.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("continuation marker truncated"));
        }
        if src[0] != TAG_CONTINUATION {
            return Err(WraithError::Corruption("continuation marker tag mismatch"));
        }
        let from_segment = u32::from_be_bytes(src[4..8].try_into().expect("slice is 4 bytes"));
        let remaining = u32::from_be_bytes(src[8..12].try_into().expect("slice is 4 bytes"));
        Ok(Self {
            from_segment,
            remaining,
        })
    }
}

/// 8-byte marker closing a frame, carrying the record count.
#[derive(Clone, Copy, Debug)]
pub struct TxnEnd {
    /// Number of records in the frame.
    pub record_count: u32,
}

impl TxnEnd {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Encodes the marker.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = TAG_END;
        buf[4..8].copy_from_slice(&self.record_count.to_be_bytes());
        buf
    }

    /// Decodes and validates a marker.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("end marker truncated"));
        }
        if src[0] != TAG_END {
            return Err(WraithError::Corruption("end marker tag mismatch"));
        }
        let record_count = u32::from_be_bytes(src[4..8].try_into().expect("slice is 4 bytes"));
        Ok(Self { record_count })
    }
}

/// 8-byte footer written behind the data region when a segment is sealed.
#[derive(Clone, Copy, Debug)]
pub struct SegmentFooter {
    /// Final head position of the sealed segment.
    pub end_offset: u32,
}

impl SegmentFooter {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Builds a footer recording the sealed head.
    pub fn new(end_offset: u32) -> Self {
        Self { end_offset }
    }

    /// Encodes the footer.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = TAG_FOOTER;
        buf[4..8].copy_from_slice(&self.end_offset.to_be_bytes());
        buf
    }

    /// Decodes and validates a footer.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("segment footer truncated"));
        }
        if src[0] != TAG_FOOTER {
            return Err(WraithError::Corruption("segment footer tag mismatch"));
        }
        let end_offset = u32::from_be_bytes(src[4..8].try_into().expect("slice is 4 bytes"));
        Ok(Self { end_offset })
    }
}

/// Repository metadata persisted beside the segment files.
///
/// Rewritten atomically on every commit: the latest frame position is the
/// entry point for the backward chain walked during recovery.
#[derive(Clone, Copy, Debug)]
pub struct MetaFile {
    /// Store mode of the repository.
    pub mode: StoreMode,
    /// Highest committed transaction id.
    pub last_commit: u64,
    /// Segment of the most recent frame, or [`NO_FRAME`].
    pub last_frame_segment: u32,
    /// Offset of the most recent frame.
    pub last_frame_offset: u32,
    /// Number of segment files.
    pub segment_count: u32,
    /// Checksum seed shared by all frames of this repository.
    pub salt: u64,
}

impl MetaFile {
    const SIZE: usize = 48;

    fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&META_MAGIC);
        buf[4..6].copy_from_slice(&META_VERSION.to_be_bytes());
        buf[6] = self.mode as u8;
        buf[8..16].copy_from_slice(&self.last_commit.to_be_bytes());
        buf[16..20].copy_from_slice(&self.last_frame_segment.to_be_bytes());
        buf[20..24].copy_from_slice(&self.last_frame_offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.segment_count.to_be_bytes());
        buf[32..40].copy_from_slice(&self.salt.to_be_bytes());
        let mut hasher = Xxh64::new(0);
        hasher.update(&buf[..40]);
        buf[40..48].copy_from_slice(&hasher.digest().to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < Self::SIZE {
            return Err(WraithError::Corruption("meta file truncated"));
        }
        if src[0..4] != META_MAGIC {
            return Err(WraithError::Corruption("meta file magic mismatch"));
        }
        let version = u16::from_be_bytes(src[4..6].try_into().expect("slice is 2 bytes"));
        if version != META_VERSION {
            return Err(WraithError::Corruption("meta file version mismatch"));
        }
        let stored = u64::from_be_bytes(src[40..48].try_into().expect("slice is 8 bytes"));
        let mut hasher = Xxh64::new(0);
        hasher.update(&src[..40]);
        if hasher.digest() != stored {
            return Err(WraithError::Corruption("meta file checksum mismatch"));
        }
        Ok(Self {
            mode: StoreMode::from_raw(src[6])?,
            last_commit: u64::from_be_bytes(src[8..16].try_into().expect("slice is 8 bytes")),
            last_frame_segment: u32::from_be_bytes(
                src[16..20].try_into().expect("slice is 4 bytes"),
            ),
            last_frame_offset: u32::from_be_bytes(
                src[20..24].try_into().expect("slice is 4 bytes"),
            ),
            segment_count: u32::from_be_bytes(src[24..28].try_into().expect("slice is 4 bytes")),
            salt: u64::from_be_bytes(src[32..40].try_into().expect("slice is 8 bytes")),
        })
    }

    /// Writes the meta file, replacing any previous one via rename.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        fs::write(&tmp, self.encode())?;
        fs::rename(&tmp, dir.join(META_FILE))?;
        Ok(())
    }

    /// Reads the meta file if present.
    pub fn read(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Self::decode(&bytes).map(Some)
    }
}

/// A decoded transaction frame.
#[derive(Clone, Debug)]
pub struct TxnFrame {
    /// The frame's header with its verified checksum.
    pub header: TxnHeader,
    /// Record payloads in write order.
    pub records: Vec<Vec<u8>>,
}

/// Streams a transaction frame into the arena, spilling across segments
/// behind continuation markers when the active segment fills up.
///
/// Holds the store's exclusive allocation guard for its whole lifetime:
/// frame bytes must be contiguous in allocation order, so no other
/// allocation may interleave while a frame is in flight.
pub struct FrameWriter<'a> {
    store: &'a SegmentStore,
    segment: Arc<Segment>,
    started: bool,
    total_remaining: usize,
    ranges: Vec<(Arc<Segment>, u32, u32)>,
    _exclusive: crate::sync::WriteGuard<'a>,
}

impl<'a> FrameWriter<'a> {
    /// Positions a writer at the store's active segment. `frame_len` is the
    /// full stream length about to be written, used to size new segments.
    pub fn new(store: &'a SegmentStore, frame_len: usize) -> Result<Self> {
        let exclusive = store.exclusive();
        let mut segment = store.active();
        if segment.remaining() == 0 {
            segment = store.grow(frame_len)?;
        }
        Ok(Self {
            store,
            segment,
            started: false,
            total_remaining: frame_len,
            ranges: Vec::new(),
            _exclusive: exclusive,
        })
    }

    /// Position the next stream byte will land at.
    pub fn position(&self) -> (u32, u32) {
        (self.segment.id(), self.segment.head() as u32)
    }

    /// Appends bytes to the frame stream.
    pub fn write(&mut self, mut bytes: &[u8]) -> Result<()> {
        self.total_remaining = self.total_remaining.saturating_sub(bytes.len());
        while !bytes.is_empty() {
            let remaining = self.segment.remaining();
            if remaining == 0 {
                self.roll_over(bytes.len())?;
                continue;
            }
            let take = remaining.min(bytes.len());
            let offset = self.segment.alloc(take)?;
            self.segment.write_at(offset, &bytes[..take])?;
            self.push_range(offset, take as u32);
            bytes = &bytes[take..];
            self.started = true;
        }
        Ok(())
    }

    /// Flushes every byte range the frame touched.
    pub fn finish(self) -> Result<()> {
        for (segment, offset, len) in &self.ranges {
            segment.flush(*offset, *len as usize)?;
        }
        Ok(())
    }

    fn roll_over(&mut self, still_pending: usize) -> Result<()> {
        let from = self.segment.id();
        let remaining_stream = (self.total_remaining + still_pending) as u32;
        self.segment = self
            .store
            .grow(still_pending + TxnContinuation::SIZE + self.total_remaining)?;
        if self.started {
            let marker = TxnContinuation {
                from_segment: from,
                remaining: remaining_stream,
            };
            let offset = self.segment.alloc(TxnContinuation::SIZE)?;
            debug_assert_eq!(offset, 0, "continuation must open the new segment");
            self.segment.write_at(offset, &marker.encode())?;
            self.push_range(offset, TxnContinuation::SIZE as u32);
            debug!(
                from,
                to = self.segment.id(),
                remaining = remaining_stream,
                "frame continued into next segment"
            );
        }
        Ok(())
    }

    fn push_range(&mut self, offset: u32, len: u32) {
        if let Some((segment, last_off, last_len)) = self.ranges.last_mut() {
            if segment.id() == self.segment.id() && *last_off + *last_len == offset {
                *last_len += len;
                return;
            }
        }
        self.ranges.push((Arc::clone(&self.segment), offset, len));
    }
}

/// Reads a frame stream back, following continuation markers.
pub struct FrameReader<'a> {
    store: &'a SegmentStore,
    segment: Arc<Segment>,
    pos: u32,
}

impl<'a> FrameReader<'a> {
    /// Positions a reader at a frame start.
    pub fn new(store: &'a SegmentStore, segment_id: u32, offset: u32) -> Result<Self> {
        let segment = store
            .segment(segment_id)
            .ok_or(WraithError::Corruption("frame references unknown segment"))?;
        Ok(Self {
            store,
            segment,
            pos: offset,
        })
    }

    /// Reads exactly `len` stream bytes.
    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut left = len;
        while left > 0 {
            let capacity = self.segment.capacity() as u32;
            if self.pos == capacity {
                self.jump_to_next_segment()?;
                continue;
            }
            let available = (capacity - self.pos) as usize;
            let take = available.min(left);
            out.extend_from_slice(self.segment.read(self.pos, take)?);
            self.pos += take as u32;
            left -= take;
        }
        Ok(out)
    }

    fn jump_to_next_segment(&mut self) -> Result<()> {
        let from = self.segment.id();
        let next = self
            .store
            .segment(from + 1)
            .ok_or(WraithError::Corruption("frame stream ends mid-record"))?;
        let marker = TxnContinuation::decode(next.read(0, TxnContinuation::SIZE)?)?;
        if marker.from_segment != from {
            return Err(WraithError::Corruption(
                "continuation marker links wrong segment",
            ));
        }
        self.segment = next;
        self.pos = TxnContinuation::SIZE as u32;
        Ok(())
    }
}

/// Appends a checksummed transaction frame for `records` and returns its
/// start position.
pub fn write_txn_frame(
    store: &SegmentStore,
    salt: u64,
    txn_id: u64,
    prev: (u32, u32),
    records: &[&[u8]],
) -> Result<(u32, u32)> {
    let payload: usize = records.iter().map(|r| r.len()).sum();
    let mut hasher = Xxh64::new(salt);
    for record in records {
        hasher.update(record);
    }
    let header = TxnHeader {
        origin: store.mode(),
        prev_segment: prev.0,
        prev_offset: prev.1,
        size: u32::try_from(payload)
            .map_err(|_| WraithError::Config("transaction frame payload over 4GiB"))?,
        txn_id,
        checksum: hasher.digest(),
    };
    let frame_len = TxnHeader::SIZE
        + records.len() * RecordHeader::SIZE
        + payload
        + TxnEnd::SIZE;
    let mut writer = FrameWriter::new(store, frame_len)?;
    let start = writer.position();
    writer.write(&header.encode())?;
    for record in records {
        let record_header = RecordHeader {
            len: record.len() as u32,
        };
        writer.write(&record_header.encode())?;
        writer.write(record)?;
    }
    let end = TxnEnd {
        record_count: records.len() as u32,
    };
    writer.write(&end.encode())?;
    writer.finish()?;
    debug!(txn_id, payload, records = records.len(), "frame written");
    Ok(start)
}

/// Reads a transaction frame at `(segment_id, offset)`, verifying its
/// checksum and end marker.
pub fn read_txn_frame(
    store: &SegmentStore,
    salt: u64,
    segment_id: u32,
    offset: u32,
) -> Result<TxnFrame> {
    let mut reader = FrameReader::new(store, segment_id, offset)?;
    let header = TxnHeader::decode(&reader.read(TxnHeader::SIZE)?)?;
    let mut records = Vec::new();
    let mut hasher = Xxh64::new(salt);
    let mut payload_left = header.size as usize;
    while payload_left > 0 {
        let record_header = RecordHeader::decode(&reader.read(RecordHeader::SIZE)?)?;
        let len = record_header.len as usize;
        if len > payload_left {
            return Err(WraithError::Corruption("record overruns frame payload"));
        }
        let bytes = reader.read(len)?;
        hasher.update(&bytes);
        records.push(bytes);
        payload_left -= len;
    }
    let end = TxnEnd::decode(&reader.read(TxnEnd::SIZE)?)?;
    if end.record_count as usize != records.len() {
        return Err(WraithError::Corruption("frame record count mismatch"));
    }
    if hasher.digest() != header.checksum {
        return Err(WraithError::Corruption("frame checksum mismatch"));
    }
    Ok(TxnFrame { header, records })
}
