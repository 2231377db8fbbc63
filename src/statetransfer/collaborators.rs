//! Local services the state transfer core reads from and writes to.

use crate::error::Result;
use crate::topology::KeyPartitioner;
use crate::types::{Address, InternalEntry, SegmentId, SegmentSet, TransactionInfo};
use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

/// The local entry store.
#[async_trait::async_trait]
pub trait DataContainer: Send + Sync + std::fmt::Debug {
    /// Segment a key maps to.
    fn segment_of(&self, key: &[u8]) -> SegmentId;

    /// Write an entry. Returns once the entry is visible to local reads.
    async fn put(&self, entry: InternalEntry) -> Result<()>;

    /// Read an entry.
    async fn get(&self, key: &[u8]) -> Option<InternalEntry>;

    /// Remove an entry.
    async fn remove(&self, key: &[u8]) -> Result<()>;

    /// Every entry stored for a segment.
    async fn entries_for_segment(&self, segment: SegmentId) -> Result<Vec<InternalEntry>>;

    /// Drop every entry of the given segments. Returns how many were removed.
    async fn remove_segments(&self, segments: &SegmentSet) -> Result<usize>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-flight transactions, consulted before state is moved.
pub trait TransactionTable: Send + Sync + std::fmt::Debug {
    /// Transactions holding locks on keys in `segments`.
    fn transactions_for_segments(&self, segments: &SegmentSet) -> Vec<TransactionInfo>;

    /// Register transactions received from `origin` ahead of their state.
    fn apply_remote_transactions(&self, origin: &Address, transactions: Vec<TransactionInfo>);
}

/// Transaction table kept in memory.
#[derive(Debug)]
pub struct LocalTransactionTable {
    partitioner: KeyPartitioner,
    transactions: DashMap<Uuid, TransactionInfo>,
}

impl LocalTransactionTable {
    /// Create an empty table.
    pub fn new(partitioner: KeyPartitioner) -> Self {
        Self {
            partitioner,
            transactions: DashMap::new(),
        }
    }

    /// Register a local transaction.
    pub fn register(&self, transaction: TransactionInfo) {
        self.transactions.insert(transaction.global_tx, transaction);
    }

    /// Forget a finished transaction.
    pub fn complete(&self, global_tx: &Uuid) -> Option<TransactionInfo> {
        self.transactions.remove(global_tx).map(|(_, tx)| tx)
    }

    /// Look up a transaction.
    pub fn get(&self, global_tx: &Uuid) -> Option<TransactionInfo> {
        self.transactions.get(global_tx).map(|tx| tx.clone())
    }

    /// Number of known transactions.
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Check if there are no transactions.
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl TransactionTable for LocalTransactionTable {
    fn transactions_for_segments(&self, segments: &SegmentSet) -> Vec<TransactionInfo> {
        self.transactions
            .iter()
            .filter(|tx| {
                tx.locked_keys
                    .iter()
                    .any(|key| segments.contains(&self.partitioner.segment_of(key)))
            })
            .map(|tx| tx.clone())
            .collect()
    }

    fn apply_remote_transactions(&self, origin: &Address, transactions: Vec<TransactionInfo>) {
        if !transactions.is_empty() {
            tracing::debug!(%origin, count = transactions.len(), "Registering remote transactions");
        }
        for transaction in transactions {
            self.transactions
                .entry(transaction.global_tx)
                .or_insert(transaction);
        }
    }
}

/// Scattered mode read-bias bookkeeping.
pub trait BiasManager: Send + Sync + std::fmt::Debug {
    /// Drop every bias this node granted for keys in `segments`.
    fn revoke_local_bias_for_segments(&self, segments: &SegmentSet);
}

/// Bias grants kept in memory: key to the node allowed to read it locally.
#[derive(Debug)]
pub struct LocalBiasManager {
    partitioner: KeyPartitioner,
    grants: DashMap<Bytes, Address>,
}

impl LocalBiasManager {
    /// Create a manager with no grants.
    pub fn new(partitioner: KeyPartitioner) -> Self {
        Self {
            partitioner,
            grants: DashMap::new(),
        }
    }

    /// Grant `node` a read bias on `key`.
    pub fn grant(&self, key: Bytes, node: Address) {
        self.grants.insert(key, node);
    }

    /// Node holding the bias on `key`.
    pub fn bias_holder(&self, key: &[u8]) -> Option<Address> {
        self.grants.get(key).map(|node| node.clone())
    }
}

impl BiasManager for LocalBiasManager {
    fn revoke_local_bias_for_segments(&self, segments: &SegmentSet) {
        let before = self.grants.len();
        self.grants
            .retain(|key, _| !segments.contains(&self.partitioner.segment_of(key)));
        tracing::debug!(
            revoked = before - self.grants.len(),
            ?segments,
            "Revoked local bias"
        );
    }
}
