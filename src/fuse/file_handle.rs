//! Open file handle with chunk-granular write buffering.
//!
//! Writes land in a per-handle `DirtyBuffer` holding only the chunks they
//! touched; flush turns the buffer into one publish that uploads the dirty
//! chunks and reuses every other chunk message of the base generation.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::mapping::chunking::{chunk_count, chunk_len, chunk_offset, chunk_span, max_file_size};
use crate::mapping::manifest::ChunkRef;
use crate::store::{ChunkUpload, PublishRequest, PublishedManifest};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// The caller must fetch and `install` this chunk first.
    #[error("Chunk {0} is not resident")]
    NotLoaded(u32),
    #[error("Offset {0} is beyond the largest representable file")]
    TooLarge(u64),
}

/// Where the plaintext of one chunk currently lives.
#[derive(Debug)]
pub enum ChunkSource<'a> {
    Resident(&'a [u8]),
    Stored(&'a ChunkRef),
    /// Never written: reads as zeros.
    Zeros,
}

/// One chunk's share of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSlice {
    pub index: u32,
    /// Plaintext length of the chunk at the current size.
    pub chunk_len: usize,
    /// Bytes of the chunk that fall inside the read.
    pub range: Range<usize>,
}

/// Pending changes of one open file relative to the generation it was opened
/// at.
#[derive(Clone)]
pub struct DirtyBuffer {
    base: PublishedManifest,
    /// Base chunks still usable at the current size.
    base_chunks: Vec<ChunkRef>,
    chunk_size: u32,
    size: u64,
    resident: BTreeMap<u32, Zeroizing<Vec<u8>>>,
    dirty: BTreeSet<u32>,
    mode: u32,
    mtime_ms: u64,
    meta_dirty: bool,
}

impl DirtyBuffer {
    pub fn new(base: PublishedManifest) -> Self {
        let m = &base.manifest;
        Self {
            base_chunks: m.chunks.clone(),
            chunk_size: m.chunk_size,
            size: m.size,
            mode: m.mode,
            mtime_ms: m.mtime_ms,
            resident: BTreeMap::new(),
            dirty: BTreeSet::new(),
            meta_dirty: false,
            base,
        }
    }

    pub fn base(&self) -> &PublishedManifest {
        &self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    pub fn mtime_ms(&self) -> u64 {
        self.mtime_ms
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
            || self.meta_dirty
            || self.size != self.base.manifest.size
            || self.base_chunks.len() != self.base.manifest.chunks.len()
    }

    pub fn dirty_chunks(&self) -> impl Iterator<Item = u32> + '_ {
        self.dirty.iter().copied()
    }

    /// Chunks at the current size. `write` and `truncate` keep the size
    /// within `max_file_size`, and stored manifests are validated against it.
    fn chunk_total(&self) -> u32 {
        chunk_count(self.size, self.chunk_size).unwrap_or(u32::MAX)
    }

    fn expected_len(&self, index: u32) -> usize {
        chunk_len(index, self.size, self.chunk_size) as usize
    }

    /// Base chunk that must be fetched before `index` can be modified.
    fn pending_load(&self, index: u32) -> Option<&ChunkRef> {
        if self.resident.contains_key(&index) {
            None
        } else {
            self.base_chunks.get(index as usize)
        }
    }

    /// Chunks to fetch before writing `[offset, offset + len)`.
    pub fn loads_for_write(&self, offset: u64, len: u64) -> Vec<ChunkRef> {
        chunk_span(offset, len, self.chunk_size)
            .into_iter()
            .flatten()
            .filter_map(|i| self.pending_load(i).cloned())
            .collect()
    }

    /// Chunk to fetch before truncating to `new_size`, if the cut falls
    /// inside a stored chunk.
    pub fn load_for_truncate(&self, new_size: u64) -> Option<ChunkRef> {
        let cut = (new_size % self.chunk_size as u64) as usize;
        if new_size >= self.size || cut == 0 {
            return None;
        }
        let index = (new_size / self.chunk_size as u64) as u32;
        self.pending_load(index)
            .filter(|r| r.plain_len as usize > cut)
            .cloned()
    }

    /// Stored chunks whose length changes at the current size.
    pub fn loads_for_flush(&self) -> Vec<ChunkRef> {
        (0..self.chunk_total())
            .filter_map(|i| {
                self.pending_load(i)
                    .filter(|r| r.plain_len as usize != self.expected_len(i))
                    .cloned()
            })
            .collect()
    }

    /// Make a fetched base chunk resident. Does not mark it dirty.
    pub fn install(&mut self, index: u32, plaintext: Zeroizing<Vec<u8>>) {
        self.resident.entry(index).or_insert(plaintext);
    }

    /// Where chunk `index` reads from.
    pub fn source(&self, index: u32) -> ChunkSource<'_> {
        if let Some(data) = self.resident.get(&index) {
            ChunkSource::Resident(data)
        } else if let Some(chunk) = self.base_chunks.get(index as usize) {
            ChunkSource::Stored(chunk)
        } else {
            ChunkSource::Zeros
        }
    }

    /// Per-chunk pieces of a read of `len` bytes at `offset`, clipped to the
    /// current size.
    pub fn read_slices(&self, offset: u64, len: u64) -> Vec<ReadSlice> {
        let end = offset.saturating_add(len).min(self.size);
        if offset >= end {
            return Vec::new();
        }
        chunk_span(offset, end - offset, self.chunk_size)
            .into_iter()
            .flatten()
            .map(|index| {
                let start = chunk_offset(index, self.chunk_size);
                let chunk_len = self.expected_len(index);
                let from = (offset.max(start) - start) as usize;
                let to = (end.min(start + chunk_len as u64) - start) as usize;
                ReadSlice {
                    index,
                    chunk_len,
                    range: from..to,
                }
            })
            .collect()
    }

    /// Apply a write. Every chunk from `loads_for_write` must be installed.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize, BufferError> {
        let len = data.len() as u64;
        if len == 0 {
            return Ok(0);
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= max_file_size(self.chunk_size))
            .ok_or(BufferError::TooLarge(offset))?;
        let Some(span) = chunk_span(offset, len, self.chunk_size) else {
            return Err(BufferError::TooLarge(offset));
        };
        if let Some(missing) = span.clone().find(|i| self.pending_load(*i).is_some()) {
            return Err(BufferError::NotLoaded(missing));
        }

        let c = self.chunk_size as u64;
        for index in span {
            let start = chunk_offset(index, self.chunk_size);
            let current_len = self.expected_len(index);
            let buf = self
                .resident
                .entry(index)
                .or_insert_with(|| Zeroizing::new(vec![0u8; current_len]));

            let from = offset.max(start);
            let to = end.min(start + c);
            let local = (from - start) as usize..(to - start) as usize;
            if buf.len() < local.end {
                buf.resize(local.end, 0);
            }
            buf[local].copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);
            self.dirty.insert(index);
        }
        self.size = self.size.max(end);
        Ok(data.len())
    }

    /// Shrink or grow to `new_size`. A cut inside a stored chunk needs that
    /// chunk from `load_for_truncate` installed first. Growth is zero-filled
    /// lazily at flush.
    pub fn truncate(&mut self, new_size: u64) -> Result<(), BufferError> {
        let count =
            chunk_count(new_size, self.chunk_size).ok_or(BufferError::TooLarge(new_size))?;
        if new_size < self.size {
            let cut = (new_size % self.chunk_size as u64) as usize;
            if let Some(chunk) = self.load_for_truncate(new_size) {
                return Err(BufferError::NotLoaded(chunk.index));
            }

            self.base_chunks.truncate(count as usize);
            self.resident.retain(|i, _| *i < count);
            self.dirty.retain(|i| *i < count);
            if cut != 0 {
                let last = count - 1;
                if let Some(buf) = self.resident.get_mut(&last) {
                    if buf.len() > cut {
                        buf.truncate(cut);
                        self.dirty.insert(last);
                    }
                }
            }
        }
        self.size = new_size;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.mode = mode;
        self.meta_dirty = true;
    }

    pub fn set_mtime(&mut self, mtime_ms: u64) {
        self.mtime_ms = mtime_ms;
        self.meta_dirty = true;
    }

    /// Content changed at `now_ms`.
    pub fn touch(&mut self, now_ms: u64) {
        self.mtime_ms = now_ms;
    }

    /// The publish that commits this buffer. Every chunk from
    /// `loads_for_flush` must be installed.
    pub fn publish_request(&self, path: &str, now_ms: u64) -> Result<PublishRequest, BufferError> {
        let count = self.chunk_total();
        let mut chunks = Vec::with_capacity(count as usize);
        for index in 0..count {
            let expected = self.expected_len(index);
            let base = self
                .base_chunks
                .get(index as usize)
                .filter(|r| r.plain_len as usize == expected);
            let upload = match (self.resident.get(&index), base) {
                (Some(data), Some(chunk))
                    if !self.dirty.contains(&index) && data.len() == expected =>
                {
                    ChunkUpload::Reuse(chunk.clone())
                }
                (Some(data), _) => {
                    let mut plaintext = Zeroizing::new(data.to_vec());
                    plaintext.resize(expected, 0);
                    ChunkUpload::Upload(plaintext)
                }
                (None, Some(chunk)) => ChunkUpload::Reuse(chunk.clone()),
                (None, None) if self.base_chunks.len() > index as usize => {
                    return Err(BufferError::NotLoaded(index));
                }
                (None, None) => ChunkUpload::Zeros(expected),
            };
            chunks.push(upload);
        }

        Ok(PublishRequest {
            path: path.to_string(),
            base: Some(self.base.clone()),
            kind: self.base.manifest.kind.clone(),
            size: self.size,
            mode: self.mode,
            mtime_ms: self.mtime_ms,
            ctime_ms: now_ms,
            chunk_size: self.chunk_size,
            chunks,
        })
    }

    /// Adopt a committed generation as the new base.
    pub fn committed(&mut self, record: PublishedManifest) {
        *self = Self::new(record);
    }

    /// The file moved without content changes; `record` is the moved
    /// generation.
    pub fn renamed(&mut self, record: PublishedManifest) {
        if self.is_dirty() {
            self.base = record;
        } else {
            *self = Self::new(record);
        }
    }
}

/// Open file handle.
///
/// Every handle carries a buffer based on the generation current at open;
/// only writable handles ever dirty it.
pub struct OpenFileHandle {
    /// Inode number of the open file.
    pub ino: u64,
    /// Open flags (O_RDONLY, O_WRONLY, O_RDWR, O_APPEND, ...).
    pub flags: i32,
    pub path: String,
    pub buffer: DirtyBuffer,
}

impl OpenFileHandle {
    pub fn new(ino: u64, flags: i32, path: &str, base: PublishedManifest) -> Self {
        Self {
            ino,
            flags,
            path: path.to_string(),
            buffer: DirtyBuffer::new(base),
        }
    }

    pub fn writable(&self) -> bool {
        matches!(self.flags & libc::O_ACCMODE, libc::O_WRONLY | libc::O_RDWR)
    }

    pub fn appending(&self) -> bool {
        self.flags & libc::O_APPEND != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::manifest::{ChunkOrigin, Manifest, NodeKind, MANIFEST_VERSION};

    const C: u32 = 16;

    /// A stored file whose chunk `i` is filled with byte `i + 1`.
    fn stored(size: u64, chunk_size: u32) -> PublishedManifest {
        let chunks = (0..chunk_count(size, chunk_size).unwrap())
            .map(|index| ChunkRef {
                index,
                plain_len: chunk_len(index, size, chunk_size),
                encoded_len: 0,
                checksum: String::new(),
                message_id: 1000 + index as u64,
                origin: ChunkOrigin {
                    path_id: "p".to_string(),
                    generation: 0,
                    salt: "s".to_string(),
                },
            })
            .collect();
        PublishedManifest {
            manifest: Manifest {
                version: MANIFEST_VERSION,
                path: "/f".to_string(),
                generation: 0,
                kind: NodeKind::File,
                size,
                mode: 0o644,
                mtime_ms: 1,
                ctime_ms: 1,
                chunk_size,
                chunks,
            },
            message_id: 999,
        }
    }

    fn plaintext(chunk: &ChunkRef) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(vec![chunk.index as u8 + 1; chunk.plain_len as usize])
    }

    fn load_all(buffer: &mut DirtyBuffer, chunks: Vec<ChunkRef>) {
        for chunk in chunks {
            buffer.install(chunk.index, plaintext(&chunk));
        }
    }

    fn kinds(request: &PublishRequest) -> Vec<&'static str> {
        request
            .chunks
            .iter()
            .map(|c| match c {
                ChunkUpload::Reuse(_) => "reuse",
                ChunkUpload::Upload(_) => "upload",
                ChunkUpload::Zeros(_) => "zeros",
            })
            .collect()
    }

    #[test]
    fn test_write_dirties_exactly_the_span() {
        let mut buffer = DirtyBuffer::new(stored(80, C));
        let loads = buffer.loads_for_write(20, 20);
        assert_eq!(loads.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(buffer.write(20, &[9u8; 20]), Err(BufferError::NotLoaded(1)));

        load_all(&mut buffer, loads);
        assert_eq!(buffer.write(20, &[9u8; 20]), Ok(20));
        assert_eq!(buffer.dirty_chunks().collect::<Vec<_>>(), vec![1, 2]);

        let request = buffer.publish_request("/f", 5).unwrap();
        assert_eq!(kinds(&request), vec!["reuse", "upload", "upload", "reuse", "reuse"]);
    }

    #[test]
    fn test_two_writes_accumulate() {
        let mut buffer = DirtyBuffer::new(stored(0, C));
        buffer.write(0, b"hello").unwrap();
        buffer.write(5, b" world").unwrap();
        assert_eq!(buffer.size(), 11);
        match buffer.source(0) {
            ChunkSource::Resident(data) => assert_eq!(data, b"hello world"),
            other => panic!("expected resident chunk, got {:?}", other),
        }
        assert_eq!(buffer.publish_request("/f", 2).unwrap().chunks.len(), 1);
    }

    #[test]
    fn test_sparse_write_past_end() {
        let mut buffer = DirtyBuffer::new(stored(0, 65536));
        assert!(buffer.loads_for_write(70000, 10).is_empty());
        buffer.write(70000, &[7u8; 10]).unwrap();
        assert_eq!(buffer.size(), 70010);

        let request = buffer.publish_request("/f", 3).unwrap();
        assert_eq!(request.size, 70010);
        assert_eq!(request.chunks.len(), 2);
        match (&request.chunks[0], &request.chunks[1]) {
            (ChunkUpload::Zeros(len), ChunkUpload::Upload(tail)) => {
                assert_eq!(*len, 65536);
                assert_eq!(tail.len(), 4474);
                assert!(tail[..4464].iter().all(|b| *b == 0));
                assert_eq!(&tail[4464..], &[7u8; 10]);
            }
            _ => panic!("expected a zero gap then the written tail"),
        }
    }

    #[test]
    fn test_read_slices_clip_to_size() {
        let buffer = DirtyBuffer::new(stored(40, C));
        let slices = buffer.read_slices(10, 100);
        assert_eq!(
            slices,
            vec![
                ReadSlice { index: 0, chunk_len: 16, range: 10..16 },
                ReadSlice { index: 1, chunk_len: 16, range: 0..16 },
                ReadSlice { index: 2, chunk_len: 8, range: 0..8 },
            ]
        );
        assert!(buffer.read_slices(40, 5).is_empty());
    }

    #[test]
    fn test_truncate_on_chunk_boundary_drops_trailing_chunks() {
        let base = stored(48, C);
        let mut buffer = DirtyBuffer::new(base.clone());
        assert!(buffer.load_for_truncate(16).is_none());
        buffer.truncate(16).unwrap();
        assert!(buffer.is_dirty());

        let request = buffer.publish_request("/f", 4).unwrap();
        assert_eq!(request.size, 16);
        match &request.chunks[..] {
            [ChunkUpload::Reuse(chunk)] => assert_eq!(chunk, &base.manifest.chunks[0]),
            _ => panic!("expected one reused chunk"),
        }
    }

    #[test]
    fn test_truncate_inside_chunk_reencodes_it() {
        let mut buffer = DirtyBuffer::new(stored(48, C));
        let load = buffer.load_for_truncate(20).unwrap();
        assert_eq!(load.index, 1);
        assert_eq!(buffer.truncate(20), Err(BufferError::NotLoaded(1)));
        buffer.install(1, plaintext(&load));
        buffer.truncate(20).unwrap();

        // Growing again must expose zeros, not the cut bytes.
        buffer.truncate(32).unwrap();
        assert!(buffer.loads_for_flush().is_empty());
        let request = buffer.publish_request("/f", 4).unwrap();
        assert_eq!(kinds(&request), vec!["reuse", "upload"]);
        match &request.chunks[1] {
            ChunkUpload::Upload(data) => {
                assert_eq!(&data[..4], &[2u8; 4]);
                assert!(data[4..].iter().all(|b| *b == 0));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_growth_reencodes_partial_last_chunk() {
        let mut buffer = DirtyBuffer::new(stored(20, C));
        buffer.truncate(40).unwrap();
        let loads = buffer.loads_for_flush();
        assert_eq!(loads.iter().map(|c| c.index).collect::<Vec<_>>(), vec![1]);
        assert_eq!(
            buffer.publish_request("/f", 1).err(),
            Some(BufferError::NotLoaded(1))
        );

        load_all(&mut buffer, loads);
        let request = buffer.publish_request("/f", 1).unwrap();
        assert_eq!(kinds(&request), vec!["reuse", "upload", "zeros"]);
    }

    #[test]
    fn test_truncate_past_index_space_is_rejected() {
        let mut buffer = DirtyBuffer::new(stored(20, C));
        assert_eq!(buffer.truncate(1 << 40), Err(BufferError::TooLarge(1 << 40)));
        let limit = max_file_size(C);
        assert_eq!(buffer.truncate(limit + 1), Err(BufferError::TooLarge(limit + 1)));
        assert_eq!(buffer.size(), 20);
        assert!(!buffer.is_dirty());
        assert_eq!(buffer.publish_request("/f", 1).unwrap().chunks.len(), 2);
    }

    #[test]
    fn test_write_past_index_space_is_rejected() {
        let mut buffer = DirtyBuffer::new(stored(0, C));
        let limit = max_file_size(C);
        assert_eq!(buffer.write(limit, b"x"), Err(BufferError::TooLarge(limit)));
        assert_eq!(buffer.write(u64::MAX, b"x"), Err(BufferError::TooLarge(u64::MAX)));
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn test_metadata_only_change_reuses_everything() {
        let mut buffer = DirtyBuffer::new(stored(40, C));
        assert!(!buffer.is_dirty());
        buffer.set_mode(0o600);
        assert!(buffer.is_dirty());
        let request = buffer.publish_request("/f", 9).unwrap();
        assert_eq!(request.mode, 0o600);
        assert_eq!(kinds(&request), vec!["reuse", "reuse", "reuse"]);
    }

    #[test]
    fn test_committed_resets_state() {
        let mut buffer = DirtyBuffer::new(stored(0, C));
        buffer.write(0, b"abc").unwrap();
        let mut next = stored(3, C);
        next.manifest.generation = 1;
        buffer.committed(next);
        assert!(!buffer.is_dirty());
        assert_eq!(buffer.base().generation(), 1);
        assert!(matches!(buffer.source(0), ChunkSource::Stored(_)));
    }

    #[test]
    fn test_handle_flags() {
        let rw = OpenFileHandle::new(2, libc::O_RDWR | libc::O_APPEND, "/f", stored(0, C));
        assert!(rw.writable());
        assert!(rw.appending());
        let ro = OpenFileHandle::new(2, libc::O_RDONLY, "/f", stored(0, C));
        assert!(!ro.writable());
    }
}
