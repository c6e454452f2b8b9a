//! Journal Record Codecs
//!
//! Self-describing, versioned binary encoding for everything the system
//! journal writes to chunk storage.
//!
//! ## Frame Format
//!
//! Every blob (record batch or snapshot) is wrapped in one frame:
//!
//! ```text
//! ┌─────────┬──────┬─────────────┬─────────┬──────────┐
//! │ Version │ Kind │ Payload Len │ CRC32   │ Payload  │
//! │ (1 byte)│(1 b) │ (4 bytes BE)│(4 bytes)│ (N bytes)│
//! └─────────┴──────┴─────────────┴─────────┴──────────┘
//! ```
//!
//! The CRC covers the payload. Frames are written back to back into a
//! journal file; a frame that fails to decode (truncated tail after a crash,
//! or garbage appended by a fenced-out writer) terminates replay of that
//! file — decoding is total, never panicking, which is why every decoder
//! returns `Option`.
//!
//! ## Field Encoding
//!
//! Fixed-width big-endian signed integers for offsets/lengths/epochs,
//! length-prefixed UTF-8 strings, a one-byte presence flag for nullable
//! strings, and length-prefixed arrays.

use bytes::{BufMut, Bytes, BytesMut};
use chunkhouse_metadata::{ChunkMetadata, SegmentMetadata};

const FORMAT_VERSION: u8 = 1;
const FRAME_HEADER_LEN: usize = 1 + 1 + 4 + 4;

const KIND_BATCH: u8 = 1;
const KIND_SNAPSHOT: u8 = 2;

const REC_CHUNK_ADDED: u8 = 1;
const REC_TRUNCATION: u8 = 2;

/// States that `new_chunk_name` was linked into `segment_name` at `offset`,
/// immediately after `old_chunk_name` (`None` = it became the first chunk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAddedRecord {
    pub segment_name: String,
    pub offset: u64,
    pub new_chunk_name: String,
    pub old_chunk_name: Option<String>,
}

/// States that `segment_name` was truncated at `offset`, making
/// `first_chunk_name` the new first chunk whose first byte sits at segment
/// offset `start_offset`. `first_chunk_name` is `None` when the truncation
/// consumed every chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationRecord {
    pub segment_name: String,
    pub offset: u64,
    pub first_chunk_name: Option<String>,
    pub start_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemJournalRecord {
    ChunkAdded(ChunkAddedRecord),
    Truncation(TruncationRecord),
}

impl SystemJournalRecord {
    pub fn segment_name(&self) -> &str {
        match self {
            SystemJournalRecord::ChunkAdded(r) => &r.segment_name,
            SystemJournalRecord::Truncation(r) => &r.segment_name,
        }
    }
}

/// The atomic unit of journal durability: one batch per blob write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemJournalRecordBatch {
    pub records: Vec<SystemJournalRecord>,
}

/// Point-in-time image of one system segment and its chunk chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSnapshotRecord {
    pub segment: SegmentMetadata,
    pub chunks: Vec<ChunkMetadata>,
}

/// Authoritative image of all system segments at a known epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSnapshotRecord {
    pub epoch: u64,
    pub segments: Vec<SegmentSnapshotRecord>,
}

impl SystemJournalRecordBatch {
    pub fn new(records: Vec<SystemJournalRecord>) -> Self {
        Self { records }
    }

    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_u32(self.records.len() as u32);
        for record in &self.records {
            put_record(&mut payload, record);
        }
        encode_frame(KIND_BATCH, &payload)
    }

    /// Decode one batch frame from the front of `buf`, returning the batch
    /// and the number of bytes consumed. `None` means the frame is corrupt
    /// or truncated and replay of this file must stop.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let (kind, payload, consumed) = decode_frame(buf)?;
        if kind != KIND_BATCH {
            return None;
        }
        let mut reader = Reader::new(payload);
        let count = reader.get_u32()?;
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            records.push(get_record(&mut reader)?);
        }
        if !reader.is_empty() {
            return None;
        }
        Some((Self { records }, consumed))
    }
}

impl SystemSnapshotRecord {
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        payload.put_i64(self.epoch as i64);
        payload.put_u32(self.segments.len() as u32);
        for segment in &self.segments {
            put_segment_snapshot(&mut payload, segment);
        }
        encode_frame(KIND_SNAPSHOT, &payload)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let (kind, payload, _) = decode_frame(buf)?;
        if kind != KIND_SNAPSHOT {
            return None;
        }
        let mut reader = Reader::new(payload);
        let epoch = reader.get_i64()? as u64;
        let count = reader.get_u32()?;
        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            segments.push(get_segment_snapshot(&mut reader)?);
        }
        if !reader.is_empty() {
            return None;
        }
        Some(Self { epoch, segments })
    }
}

fn encode_frame(kind: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(kind);
    buf.put_u32(payload.len() as u32);
    buf.put_u32(crc32fast::hash(payload));
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_frame(buf: &[u8]) -> Option<(u8, &[u8], usize)> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    if buf[0] != FORMAT_VERSION {
        return None;
    }
    let kind = buf[1];
    let payload_len = u32::from_be_bytes(buf[2..6].try_into().ok()?) as usize;
    let crc = u32::from_be_bytes(buf[6..10].try_into().ok()?);
    let end = FRAME_HEADER_LEN.checked_add(payload_len)?;
    if buf.len() < end {
        return None;
    }
    let payload = &buf[FRAME_HEADER_LEN..end];
    if crc32fast::hash(payload) != crc {
        return None;
    }
    Some((kind, payload, end))
}

fn put_record(buf: &mut BytesMut, record: &SystemJournalRecord) {
    match record {
        SystemJournalRecord::ChunkAdded(r) => {
            buf.put_u8(REC_CHUNK_ADDED);
            put_string(buf, &r.segment_name);
            buf.put_i64(r.offset as i64);
            put_string(buf, &r.new_chunk_name);
            put_opt_string(buf, r.old_chunk_name.as_deref());
        }
        SystemJournalRecord::Truncation(r) => {
            buf.put_u8(REC_TRUNCATION);
            put_string(buf, &r.segment_name);
            buf.put_i64(r.offset as i64);
            put_opt_string(buf, r.first_chunk_name.as_deref());
            buf.put_i64(r.start_offset as i64);
        }
    }
}

fn get_record(reader: &mut Reader<'_>) -> Option<SystemJournalRecord> {
    match reader.get_u8()? {
        REC_CHUNK_ADDED => Some(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
            segment_name: reader.get_string()?,
            offset: reader.get_i64()? as u64,
            new_chunk_name: reader.get_string()?,
            old_chunk_name: reader.get_opt_string()?,
        })),
        REC_TRUNCATION => Some(SystemJournalRecord::Truncation(TruncationRecord {
            segment_name: reader.get_string()?,
            offset: reader.get_i64()? as u64,
            first_chunk_name: reader.get_opt_string()?,
            start_offset: reader.get_i64()? as u64,
        })),
        _ => None,
    }
}

fn put_segment_snapshot(buf: &mut BytesMut, snapshot: &SegmentSnapshotRecord) {
    put_segment_metadata(buf, &snapshot.segment);
    buf.put_u32(snapshot.chunks.len() as u32);
    for chunk in &snapshot.chunks {
        put_chunk_metadata(buf, chunk);
    }
}

fn get_segment_snapshot(reader: &mut Reader<'_>) -> Option<SegmentSnapshotRecord> {
    let segment = get_segment_metadata(reader)?;
    let count = reader.get_u32()?;
    let mut chunks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        chunks.push(get_chunk_metadata(reader)?);
    }
    Some(SegmentSnapshotRecord { segment, chunks })
}

fn put_segment_metadata(buf: &mut BytesMut, segment: &SegmentMetadata) {
    put_string(buf, &segment.name);
    buf.put_i64(segment.length as i64);
    buf.put_i64(segment.start_offset as i64);
    buf.put_u32(segment.chunk_count);
    put_opt_string(buf, segment.first_chunk.as_deref());
    put_opt_string(buf, segment.last_chunk.as_deref());
    buf.put_i64(segment.first_chunk_start_offset as i64);
    buf.put_i64(segment.last_chunk_start_offset as i64);
    buf.put_i64(segment.max_rolling_length as i64);
    buf.put_u32(segment.status);
    buf.put_i64(segment.owner_epoch as i64);
    buf.put_i64(segment.last_modified);
}

fn get_segment_metadata(reader: &mut Reader<'_>) -> Option<SegmentMetadata> {
    Some(SegmentMetadata {
        name: reader.get_string()?,
        length: reader.get_i64()? as u64,
        start_offset: reader.get_i64()? as u64,
        chunk_count: reader.get_u32()?,
        first_chunk: reader.get_opt_string()?,
        last_chunk: reader.get_opt_string()?,
        first_chunk_start_offset: reader.get_i64()? as u64,
        last_chunk_start_offset: reader.get_i64()? as u64,
        max_rolling_length: reader.get_i64()? as u64,
        status: reader.get_u32()?,
        owner_epoch: reader.get_i64()? as u64,
        last_modified: reader.get_i64()?,
    })
}

fn put_chunk_metadata(buf: &mut BytesMut, chunk: &ChunkMetadata) {
    put_string(buf, &chunk.name);
    buf.put_i64(chunk.length as i64);
    put_opt_string(buf, chunk.next_chunk.as_deref());
}

fn get_chunk_metadata(reader: &mut Reader<'_>) -> Option<ChunkMetadata> {
    Some(ChunkMetadata {
        name: reader.get_string()?,
        length: reader.get_i64()? as u64,
        next_chunk: reader.get_opt_string()?,
    })
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

/// Bounds-checked sequential reader over a payload slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn get_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn get_u32(&mut self) -> Option<u32> {
        self.take(4).and_then(|b| b.try_into().ok()).map(u32::from_be_bytes)
    }

    fn get_i64(&mut self) -> Option<i64> {
        self.take(8).and_then(|b| b.try_into().ok()).map(i64::from_be_bytes)
    }

    fn get_string(&mut self) -> Option<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    fn get_opt_string(&mut self) -> Option<Option<String>> {
        match self.get_u8()? {
            0 => Some(None),
            1 => self.get_string().map(Some),
            _ => None,
        }
    }
}
