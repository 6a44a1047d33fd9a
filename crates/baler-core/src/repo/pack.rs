use std::collections::HashSet;
use std::time::{Duration, Instant};

use baler_storage::{Backend, FileType, Handle};
use baler_types::{BalerError, BlobHandle, BlobId, BlobKind, PackId, Result};
use serde::{Deserialize, Serialize};

/// Magic bytes at the start of every pack file.
pub const PACK_MAGIC: &[u8; 8] = b"BALERPAK";
/// Pack format version.
pub const PACK_VERSION: u8 = 1;
/// Size of the pack preamble (magic + version byte).
pub const PACK_HEADER_SIZE: usize = 9;
/// Each blob is preceded by its length as u32 LE.
pub const BLOB_LENGTH_PREFIX: usize = 4;
/// The pack ends with the header length as u32 LE.
pub const TRAILER_LENGTH_SIZE: usize = 4;

/// One entry of a pack's trailing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackEntry {
    pub kind: BlobKind,
    pub id: BlobId,
    /// Position of the blob bytes, past their length prefix.
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: u32,
}

impl PackEntry {
    pub fn handle(&self) -> BlobHandle {
        BlobHandle::new(self.id, self.kind)
    }
}

pub fn pack_handle(pack_id: &PackId) -> Handle {
    Handle::new(FileType::Pack, pack_id.to_hex())
}

/// A pack assembled in memory, ready to upload.
#[derive(Debug)]
pub struct SealedPack {
    pub id: PackId,
    pub bytes: Vec<u8>,
    pub entries: Vec<PackEntry>,
}

/// Accumulates blobs of one kind and seals them into pack files.
pub struct PackWriter {
    kind: BlobKind,
    target_size: usize,
    max_blobs: usize,
    max_age: Duration,
    /// Preamble plus length-prefixed blob data written so far.
    pack_bytes: Vec<u8>,
    entries: Vec<PackEntry>,
    pending: HashSet<BlobId>,
    first_blob_time: Option<Instant>,
}

impl PackWriter {
    pub fn new(kind: BlobKind, target_size: usize, max_blobs: usize, max_age: Duration) -> Self {
        Self {
            kind,
            target_size,
            max_blobs,
            max_age,
            pack_bytes: Vec::new(),
            entries: Vec::new(),
            pending: HashSet::new(),
            first_blob_time: None,
        }
    }

    /// Append a blob. Returns the offset of its bytes within the pack.
    pub fn add_blob(&mut self, id: BlobId, data: &[u8], uncompressed_length: u32) -> Result<u32> {
        if self.entries.is_empty() {
            self.pack_bytes.extend_from_slice(PACK_MAGIC);
            self.pack_bytes.push(PACK_VERSION);
            self.first_blob_time = Some(Instant::now());
        }
        let length = u32::try_from(data.len())
            .map_err(|_| BalerError::Other(format!("blob {id} too large for a pack")))?;
        let offset = u32::try_from(self.pack_bytes.len() + BLOB_LENGTH_PREFIX)
            .map_err(|_| BalerError::Other("pack exceeds 4 GiB".into()))?;
        self.pack_bytes.extend_from_slice(&length.to_le_bytes());
        self.pack_bytes.extend_from_slice(data);
        self.entries.push(PackEntry {
            kind: self.kind,
            id,
            offset,
            length,
            uncompressed_length,
        });
        self.pending.insert(id);
        Ok(offset)
    }

    /// Check if a blob is buffered in this writer (not yet flushed).
    pub fn contains_pending(&self, id: &BlobId) -> bool {
        self.pending.contains(id)
    }

    /// Whether the buffer reached its size, count or age limit.
    pub fn should_flush(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        if self.pack_bytes.len() >= self.target_size || self.entries.len() >= self.max_blobs {
            return true;
        }
        self.first_blob_time
            .is_some_and(|t| t.elapsed() >= self.max_age)
    }

    pub fn has_pending(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Append the header trailer, compute the pack ID and reset the writer.
    pub fn seal(&mut self) -> Result<SealedPack> {
        if self.entries.is_empty() {
            return Err(BalerError::Other("cannot seal empty pack writer".into()));
        }
        let header = rmp_serde::to_vec(&self.entries)?;
        let header_len = header.len() as u32;

        let mut bytes = std::mem::take(&mut self.pack_bytes);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&header_len.to_le_bytes());
        let id = PackId::compute(&bytes);
        let entries = std::mem::take(&mut self.entries);
        self.pending.clear();
        self.first_blob_time = None;
        Ok(SealedPack { id, bytes, entries })
    }
}

/// Size a pack holding exactly `entries` has on disk.
pub fn expected_pack_size(entries: &[PackEntry]) -> Result<u64> {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|e| e.offset);
    let header = rmp_serde::to_vec(&sorted)?;
    let blobs: u64 = sorted
        .iter()
        .map(|e| (BLOB_LENGTH_PREFIX as u64) + e.length as u64)
        .sum();
    Ok(PACK_HEADER_SIZE as u64 + blobs + header.len() as u64 + TRAILER_LENGTH_SIZE as u64)
}

fn read_u32_le(bytes: &[u8], at: usize) -> Result<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| BalerError::InvalidFormat(format!("truncated length field at {at}")))
}

fn check_entries(entries: &[PackEntry], blobs_end: u64) -> Result<()> {
    let min_offset = (PACK_HEADER_SIZE + BLOB_LENGTH_PREFIX) as u64;
    for e in entries {
        let end = e.offset as u64 + e.length as u64;
        if (e.offset as u64) < min_offset || end > blobs_end {
            return Err(BalerError::InvalidFormat(format!(
                "header entry for {} at {}+{} outside blob area",
                e.handle(),
                e.offset,
                e.length
            )));
        }
    }
    Ok(())
}

/// Parse and validate a complete pack, returning its header entries.
pub fn parse_pack(bytes: &[u8]) -> Result<Vec<PackEntry>> {
    if bytes.len() < PACK_HEADER_SIZE + TRAILER_LENGTH_SIZE {
        return Err(BalerError::InvalidFormat("pack too small".into()));
    }
    if &bytes[..8] != PACK_MAGIC {
        return Err(BalerError::InvalidFormat("invalid pack magic".into()));
    }
    if bytes[8] != PACK_VERSION {
        return Err(BalerError::InvalidFormat(format!(
            "unsupported pack version {}",
            bytes[8]
        )));
    }
    let len_offset = bytes.len() - TRAILER_LENGTH_SIZE;
    let header_len = read_u32_le(bytes, len_offset)? as usize;
    if header_len > len_offset - PACK_HEADER_SIZE {
        return Err(BalerError::InvalidFormat("invalid pack header length".into()));
    }
    let blobs_end = len_offset - header_len;
    let entries: Vec<PackEntry> = rmp_serde::from_slice(&bytes[blobs_end..len_offset])?;
    check_entries(&entries, blobs_end as u64)?;
    for e in &entries {
        let prefix = read_u32_le(bytes, e.offset as usize - BLOB_LENGTH_PREFIX)?;
        if prefix != e.length {
            return Err(BalerError::InvalidFormat(format!(
                "length prefix {prefix} of {} disagrees with header length {}",
                e.handle(),
                e.length
            )));
        }
    }
    Ok(entries)
}

/// Read only the trailing header of a pack of known size using range reads.
pub fn read_pack_header(backend: &dyn Backend, pack_id: &PackId, size: u64) -> Result<Vec<PackEntry>> {
    let min = (PACK_HEADER_SIZE + TRAILER_LENGTH_SIZE) as u64;
    if size < min {
        return Err(BalerError::InvalidFormat(format!(
            "pack {pack_id} too small: {size} bytes"
        )));
    }
    let handle = pack_handle(pack_id);
    let len_offset = size - TRAILER_LENGTH_SIZE as u64;
    let trailer = backend.load(&handle, len_offset, TRAILER_LENGTH_SIZE as u64)?;
    let header_len = read_u32_le(&trailer, 0)? as u64;
    if header_len == 0 || header_len > len_offset - PACK_HEADER_SIZE as u64 {
        return Err(BalerError::InvalidFormat(format!(
            "pack {pack_id}: invalid header length {header_len}"
        )));
    }
    let blobs_end = len_offset - header_len;
    let header = backend.load(&handle, blobs_end, header_len)?;
    let entries: Vec<PackEntry> = rmp_serde::from_slice(&header)?;
    check_entries(&entries, blobs_end)?;
    Ok(entries)
}

/// Read a single blob from a pack file using a range read.
pub fn read_blob(backend: &dyn Backend, pack_id: &PackId, offset: u32, length: u32) -> Result<Vec<u8>> {
    if length == 0 {
        return Ok(Vec::new());
    }
    backend.load(&pack_handle(pack_id), offset as u64, length as u64)
}
