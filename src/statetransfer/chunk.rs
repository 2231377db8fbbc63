//! State chunks: the unit of transferred segment data.

use crate::types::{InternalEntry, SegmentId};
use serde::{Deserialize, Serialize};

/// A slice of one segment's entries.
///
/// Chunks are meaningful only relative to the topology id of the response
/// carrying them. Applying a chunk twice leaves the store unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChunk {
    /// Segment the entries belong to.
    pub segment_id: SegmentId,

    /// Entries in this chunk.
    pub entries: Vec<InternalEntry>,

    /// Whether this is the last chunk for the segment.
    pub is_last_chunk: bool,
}

impl StateChunk {
    /// Create a new chunk.
    pub fn new(segment_id: SegmentId, entries: Vec<InternalEntry>, is_last_chunk: bool) -> Self {
        Self {
            segment_id,
            entries,
            is_last_chunk,
        }
    }

    /// Get the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the chunk carries no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split a segment's entries into chunks of at most `chunk_size`.
    ///
    /// Expired entries are dropped. Always yields at least one chunk, and only
    /// the final one is marked last.
    pub fn split(segment_id: SegmentId, entries: Vec<InternalEntry>, chunk_size: usize) -> Vec<Self> {
        let chunk_size = chunk_size.max(1);
        let live: Vec<InternalEntry> = entries
            .into_iter()
            .filter(|e| !e.metadata.is_expired())
            .collect();

        if live.is_empty() {
            return vec![Self::new(segment_id, Vec::new(), true)];
        }

        let count = (live.len() + chunk_size - 1) / chunk_size;
        let mut chunks = Vec::with_capacity(count);
        let mut iter = live.into_iter().peekable();
        while iter.peek().is_some() {
            let entries: Vec<InternalEntry> = iter.by_ref().take(chunk_size).collect();
            let is_last = iter.peek().is_none();
            chunks.push(Self::new(segment_id, entries, is_last));
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryMetadata;

    fn entries(n: usize) -> Vec<InternalEntry> {
        (0..n)
            .map(|i| InternalEntry::new(format!("key{}", i), format!("value{}", i)))
            .collect()
    }

    #[test]
    fn test_split_marks_only_last() {
        let chunks = StateChunk::split(3, entries(5), 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert!(!chunks[0].is_last_chunk);
        assert!(!chunks[1].is_last_chunk);
        assert!(chunks[2].is_last_chunk);
        assert!(chunks.iter().all(|c| c.segment_id == 3));
    }

    #[test]
    fn test_split_exact_multiple() {
        let chunks = StateChunk::split(0, entries(4), 2);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_last_chunk);
    }

    #[test]
    fn test_split_empty_segment() {
        let chunks = StateChunk::split(7, Vec::new(), 10);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
        assert!(chunks[0].is_last_chunk);
    }

    #[test]
    fn test_split_drops_expired() {
        let mut all = entries(2);
        all[0].metadata = EntryMetadata {
            version: None,
            expires_at_nanos: Some(1),
        };
        let chunks = StateChunk::split(1, all, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].entries[0].key, "key1");
    }
}
