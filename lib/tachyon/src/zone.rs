const CHUNK_SIZE: usize = 65536;

/// Handle to a byte range allocated from a [`Zone`]. Only valid against the
/// zone it was allocated from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ZoneRange {
    chunk: u32,
    offset: u32,
    len: u32,
}

impl ZoneRange {
    pub const EMPTY: ZoneRange = ZoneRange {
        chunk: 0,
        offset: 0,
        len: 0,
    };

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Chunked bump allocator. Allocations are never reclaimed individually;
/// the whole zone is released at once when dropped. One zone backs each
/// snapshot, so releasing the snapshot frees every per-snapshot buffer in
/// a single sweep.
pub struct Zone {
    chunks: Vec<Vec<u8>>,
}

impl Zone {
    #[inline]
    pub fn new() -> Zone {
        Zone { chunks: Vec::new() }
    }

    /// Allocates a zeroed byte range. Allocations never straddle chunks, so
    /// a single allocation is limited to the chunk size.
    pub fn alloc(&mut self, size: usize) -> ZoneRange {
        assert!(size <= CHUNK_SIZE, "Zone allocation exceeds chunk size");

        if size == 0 {
            return ZoneRange::EMPTY;
        }

        let needs_chunk = match self.chunks.last() {
            Some(chunk) => chunk.capacity() - chunk.len() < size,
            None => true,
        };

        if needs_chunk {
            self.chunks.push(Vec::with_capacity(CHUNK_SIZE));
        }

        let chunk_index = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_index];
        let offset = chunk.len();
        chunk.resize(offset + size, 0);

        ZoneRange {
            chunk: chunk_index as u32,
            offset: offset as u32,
            len: size as u32,
        }
    }

    /// Copies `data` into freshly allocated zone storage.
    #[inline]
    pub fn write(&mut self, data: &[u8]) -> ZoneRange {
        let range = self.alloc(data.len());
        self.get_mut(range).copy_from_slice(data);
        range
    }

    #[inline]
    pub fn get(&self, range: ZoneRange) -> &[u8] {
        if range.is_empty() {
            return &[];
        }
        let chunk = &self.chunks[range.chunk as usize];
        &chunk[range.offset as usize..range.offset as usize + range.len as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, range: ZoneRange) -> &mut [u8] {
        if range.is_empty() {
            return &mut [];
        }
        let chunk = &mut self.chunks[range.chunk as usize];
        &mut chunk[range.offset as usize..range.offset as usize + range.len as usize]
    }

    /// Total bytes currently allocated.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }
}
