//! Moka-backed local store.

use crate::error::Result;
use crate::statetransfer::collaborators::DataContainer;
use crate::topology::KeyPartitioner;
use crate::types::{InternalEntry, SegmentId, SegmentSet};
use bytes::Bytes;
use moka::future::Cache;

/// Local entry store backed by Moka, partitioned into segments by key hash.
pub struct MokaDataContainer {
    cache: Cache<Bytes, InternalEntry>,
    partitioner: KeyPartitioner,
}

impl MokaDataContainer {
    /// Create an unbounded store.
    pub fn new(partitioner: KeyPartitioner) -> Self {
        Self {
            cache: Cache::builder().build(),
            partitioner,
        }
    }

    /// Create a store bounded by total key and value size in bytes.
    pub fn with_max_capacity(partitioner: KeyPartitioner, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .weigher(|key: &Bytes, entry: &InternalEntry| {
                let size = key.len() + entry.value.as_ref().map_or(0, |v| v.len());
                size.min(u32::MAX as usize) as u32
            })
            .build();
        Self { cache, partitioner }
    }

    /// The partitioner used to assign keys to segments.
    pub fn partitioner(&self) -> KeyPartitioner {
        self.partitioner
    }

    /// Run pending maintenance tasks.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<Bytes> {
        self.cache.iter().map(|(k, _)| (*k).clone()).collect()
    }
}

#[async_trait::async_trait]
impl DataContainer for MokaDataContainer {
    fn segment_of(&self, key: &[u8]) -> SegmentId {
        self.partitioner.segment_of(key)
    }

    async fn put(&self, entry: InternalEntry) -> Result<()> {
        self.cache.insert(entry.key.clone(), entry).await;
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Option<InternalEntry> {
        self.cache
            .get(key)
            .await
            .filter(|entry| !entry.metadata.is_expired())
    }

    async fn remove(&self, key: &[u8]) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn entries_for_segment(&self, segment: SegmentId) -> Result<Vec<InternalEntry>> {
        Ok(self
            .cache
            .iter()
            .filter(|(key, _)| self.partitioner.segment_of(key) == segment)
            .map(|(_, entry)| entry)
            .collect())
    }

    async fn remove_segments(&self, segments: &SegmentSet) -> Result<usize> {
        let keys: Vec<Bytes> = self
            .cache
            .iter()
            .filter(|(key, _)| segments.contains(&self.partitioner.segment_of(key)))
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &keys {
            self.cache.invalidate(key).await;
        }
        Ok(keys.len())
    }

    fn len(&self) -> usize {
        self.cache.iter().count()
    }
}

impl std::fmt::Debug for MokaDataContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaDataContainer")
            .field("entry_count", &self.cache.entry_count())
            .field("num_segments", &self.partitioner.num_segments())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_remove() {
        let container = MokaDataContainer::new(KeyPartitioner::new(16));
        container.put(InternalEntry::new("k", "v")).await.unwrap();
        let entry = container.get(b"k").await.unwrap();
        assert_eq!(entry.value.as_deref(), Some(&b"v"[..]));

        container.remove(b"k").await.unwrap();
        assert!(container.get(b"k").await.is_none());
    }

    #[tokio::test]
    async fn test_segments() {
        let partitioner = KeyPartitioner::new(4);
        let container = MokaDataContainer::new(partitioner);
        for i in 0..40 {
            container
                .put(InternalEntry::new(format!("key{}", i), "v"))
                .await
                .unwrap();
        }
        assert_eq!(container.len(), 40);

        let segment = partitioner.segment_of(b"key0");
        let entries = container.entries_for_segment(segment).await.unwrap();
        assert!(!entries.is_empty());
        assert!(entries
            .iter()
            .all(|e| partitioner.segment_of(&e.key) == segment));

        let removed = container
            .remove_segments(&crate::types::segments([segment]))
            .await
            .unwrap();
        assert_eq!(removed, entries.len());
        assert_eq!(container.len(), 40 - removed);
        assert!(container.get(b"key0").await.is_none());
    }
}
