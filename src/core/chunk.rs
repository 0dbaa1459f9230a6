//! Chunk planning for parallel range downloads
//!
//! Maps a total file size onto an ordered list of disjoint, contiguous byte
//! ranges. The plan is pure and deterministic; fetch workers consume the
//! specs without ever mutating them.

/// A single byte range of the target file, with inclusive offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Position of this chunk in the plan, used as its identity by the
    /// progress tracker.
    pub index: usize,
    /// First byte offset, inclusive
    pub start: u64,
    /// Last byte offset, inclusive
    pub end: u64,
}

impl ChunkSpec {
    /// Number of bytes covered by this chunk
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// The `Range` header value for this chunk, RFC 7233 style
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Partition `total_size` bytes into chunks of at most `chunk_size` bytes.
///
/// Returns an empty plan for `total_size == 0`; the caller falls back to an
/// unchunked transfer. The last chunk carries the remainder and may be
/// smaller than `chunk_size`.
pub fn plan(total_size: u64, chunk_size: u64) -> Vec<ChunkSpec> {
    debug_assert!(chunk_size > 0, "chunk_size must be positive");
    let mut chunks = Vec::new();

    let mut start = 0u64;
    while start < total_size {
        let end = std::cmp::min(start + chunk_size - 1, total_size - 1);
        chunks.push(ChunkSpec {
            index: chunks.len(),
            start,
            end,
        });
        start = end + 1;
    }

    chunks
}
