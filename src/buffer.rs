//! Ordered buffer of captured chunks
//!
//! Chunks are appended in the order the recording engine delivers them and
//! are never reordered or evicted: the artifact is their concatenation, and a
//! skipped fragment corrupts playback. The buffer is cleared when a stop
//! completes, never on pause. A failed take is cut back to where it began.

use std::time::Instant;

use bytes::Bytes;

/// One encoded fragment with its position in the take.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,
    /// Monotonically increasing across the lifetime of the buffer
    pub sequence: u64,
    pub received_at: Instant,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Append-only chunk sequence.
///
/// Thread-safety: not internally synchronized; the session task owns it.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: Vec<Chunk>,
    next_sequence: u64,
    total_bytes: usize,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns the sequence number assigned to it.
    pub fn push(&mut self, data: Bytes) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.total_bytes += data.len();
        self.chunks.push(Chunk {
            data,
            sequence,
            received_at: Instant::now(),
        });
        sequence
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// The fragments in capture order. Cloning `Bytes` shares the payload.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().map(|c| c.data.clone()).collect()
    }

    /// Number of chunks currently in the buffer
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Drop every chunk. Sequence numbers keep increasing.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    /// Keep the first `len` chunks and drop the rest. Sequence numbers keep
    /// increasing.
    pub fn truncate(&mut self, len: usize) {
        self.chunks.truncate(len);
        self.total_bytes = self.chunks.iter().map(Chunk::len).sum();
    }

    /// Get the sequence number that will be assigned to the next push
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let mut buffer = ChunkBuffer::new();
        buffer.push(Bytes::from_static(b"ab"));
        buffer.push(Bytes::from_static(b"c"));
        buffer.push(Bytes::from_static(b"def"));

        let data: Vec<&[u8]> = buffer.iter().map(|c| &c.data[..]).collect();
        assert_eq!(data, vec![&b"ab"[..], b"c", b"def"]);
        assert_eq!(buffer.total_bytes(), 6);
    }

    #[test]
    fn test_sequence_numbers() {
        let mut buffer = ChunkBuffer::new();
        assert_eq!(buffer.push(Bytes::from_static(b"a")), 0);
        assert_eq!(buffer.push(Bytes::from_static(b"b")), 1);
        buffer.clear();
        assert_eq!(buffer.push(Bytes::from_static(b"c")), 2);
        assert_eq!(buffer.next_sequence(), 3);
    }

    #[test]
    fn test_clear_empties_buffer() {
        let mut buffer = ChunkBuffer::new();
        buffer.push(Bytes::from(vec![0u8; 10]));
        buffer.push(Bytes::from(vec![0u8; 20]));
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_bytes(), 0);
        assert!(buffer.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_leaves_buffer_intact() {
        let mut buffer = ChunkBuffer::new();
        buffer.push(Bytes::from_static(b"xy"));
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_truncate_keeps_leading_chunks() {
        let mut buffer = ChunkBuffer::new();
        buffer.push(Bytes::from_static(b"seed"));
        buffer.push(Bytes::from_static(b"ab"));
        buffer.push(Bytes::from_static(b"c"));

        buffer.truncate(1);
        assert_eq!(buffer.snapshot(), vec![Bytes::from_static(b"seed")]);
        assert_eq!(buffer.total_bytes(), 4);
        assert_eq!(buffer.push(Bytes::from_static(b"d")), 3);

        buffer.truncate(10);
        assert_eq!(buffer.len(), 2);
    }
}
