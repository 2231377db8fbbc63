//! Pull-merge-push conflict resolution after a partition merge.
//!
//! The coordinator's manager asks every member for every segment with
//! `ConflictResolutionStart`. Replies arrive as state responses that are
//! not applied to the live store but buffered per origin here. Once all
//! origins finished (or the timeout passed) each key with diverging copies is
//! merged with the configured policy and the winner is written to the owners
//! of its segment in the preferred hash.

use crate::conflict::policy::MergePolicy;
use crate::conflict::{ConflictManager, MergeInfo, StateReceiver};
use crate::error::Result;
use crate::statetransfer::{
    CommandResponse, DataContainer, StateChunk, StateResponseCommand, StateTransferCommand,
    StateTransport,
};
use crate::topology::TopologyHolder;
use crate::types::{Address, InternalEntry, SegmentId, SegmentSet, TopologyId};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Copies collected for one resolution.
#[derive(Debug, Default)]
struct SessionState {
    /// Origin to segments whose last chunk has not arrived.
    pending: HashMap<Address, SegmentSet>,
    /// Segment to origin to entries.
    received: BTreeMap<SegmentId, HashMap<Address, Vec<InternalEntry>>>,
}

#[derive(Debug)]
struct ResolutionSession {
    state: Mutex<SessionState>,
    done: Notify,
}

impl ResolutionSession {
    fn new(origins: &[Address], segments: &SegmentSet) -> Self {
        let pending = origins
            .iter()
            .map(|origin| (origin.clone(), segments.clone()))
            .collect();
        Self {
            state: Mutex::new(SessionState {
                pending,
                received: BTreeMap::new(),
            }),
            done: Notify::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// Stop waiting for `origin`.
    fn drop_origin(&self, origin: &Address) {
        let complete = {
            let mut state = self.state.lock();
            state.pending.remove(origin);
            state.pending.is_empty()
        };
        if complete {
            self.done.notify_one();
        }
    }

    fn add(&self, origin: &Address, chunks: Vec<StateChunk>) {
        let complete = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for chunk in chunks {
                state
                    .received
                    .entry(chunk.segment_id)
                    .or_default()
                    .entry(origin.clone())
                    .or_default()
                    .extend(chunk.entries);
                if chunk.is_last_chunk {
                    let drained = match state.pending.get_mut(origin) {
                        Some(segments) => {
                            segments.remove(&chunk.segment_id);
                            segments.is_empty()
                        }
                        None => false,
                    };
                    if drained {
                        state.pending.remove(origin);
                    }
                }
            }
            state.pending.is_empty()
        };
        if complete {
            self.done.notify_one();
        }
    }

    fn take_received(&self) -> BTreeMap<SegmentId, HashMap<Address, Vec<InternalEntry>>> {
        std::mem::take(&mut self.state.lock().received)
    }
}

struct Inner {
    cache_name: String,
    local: Address,
    policy: MergePolicy,
    timeout: Duration,
    chunk_size: usize,
    transport: Arc<dyn StateTransport>,
    container: Arc<dyn DataContainer>,
    topology: Arc<TopologyHolder>,
    sessions: Mutex<HashMap<TopologyId, Arc<ResolutionSession>>>,
    keys_merged: AtomicU64,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictStateReceiver")
            .field("cache_name", &self.cache_name)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

#[async_trait::async_trait]
impl StateReceiver for Inner {
    async fn receive_state(
        &self,
        origin: &Address,
        topology_id: TopologyId,
        chunks: Vec<StateChunk>,
    ) -> Result<()> {
        let session = self.sessions.lock().get(&topology_id).cloned();
        match session {
            Some(session) => session.add(origin, chunks),
            None => debug!(
                cache = %self.cache_name,
                %origin,
                topology_id,
                "No conflict resolution running, discarding state"
            ),
        }
        Ok(())
    }
}

impl Inner {
    #[tracing::instrument(skip_all, fields(cache = %self.cache_name, topology_id = info.topology_id))]
    async fn resolve(&self, info: MergeInfo) {
        let ch = Arc::clone(&info.consistent_hash);
        let segments: SegmentSet = (0..ch.num_segments()).collect();
        let remotes: Vec<Address> = info
            .members
            .iter()
            .filter(|m| **m != self.local)
            .cloned()
            .collect();

        let session = Arc::new(ResolutionSession::new(&remotes, &segments));
        self.sessions
            .lock()
            .insert(info.topology_id, Arc::clone(&session));

        for remote in &remotes {
            let command = StateTransferCommand::ConflictResolutionStart {
                cache_name: self.cache_name.clone(),
                topology_id: info.topology_id,
                segments: segments.clone(),
            };
            match self.transport.invoke(remote, command).await {
                Ok(CommandResponse::Ack) => {}
                Ok(other) => {
                    warn!(%remote, ?other, "Member refused conflict resolution request");
                    session.drop_origin(remote);
                }
                Err(e) => {
                    warn!(%remote, error = %e, "Failed to request state for conflict resolution");
                    session.drop_origin(remote);
                }
            }
        }

        if !session.is_complete()
            && tokio::time::timeout(self.timeout, session.done.notified())
                .await
                .is_err()
        {
            warn!("Timed out waiting for conflict resolution state, merging what arrived");
        }
        self.sessions.lock().remove(&info.topology_id);

        let mut received = session.take_received();
        let mut pushes: BTreeMap<Address, BTreeMap<SegmentId, Vec<InternalEntry>>> = BTreeMap::new();
        let mut merged_keys = 0u64;

        for segment in segments {
            let mut copies = received.remove(&segment).unwrap_or_default();
            match self.container.entries_for_segment(segment).await {
                Ok(local) if !local.is_empty() => {
                    copies.insert(self.local.clone(), local);
                }
                Ok(_) => {}
                Err(e) => warn!(segment, error = %e, "Failed to read local copies"),
            }
            if copies.is_empty() {
                continue;
            }

            let preferred_owner = ch.primary_owner(segment).cloned();
            for (key, preferred, others) in group_by_key(copies, preferred_owner.as_ref()) {
                let diverged = match &preferred {
                    Some(p) => others.iter().any(|o| o != p),
                    None => true,
                };
                if !diverged {
                    continue;
                }

                let winner = self.policy.merge(preferred.as_ref(), &others);
                merged_keys += 1;
                match winner {
                    Some(winner) => {
                        for owner in ch.owners_for_segment(segment) {
                            pushes
                                .entry(owner.clone())
                                .or_default()
                                .entry(segment)
                                .or_default()
                                .push(winner.clone());
                        }
                    }
                    None => {
                        if ch.is_segment_local_to(&self.local, segment) {
                            if let Err(e) = self.container.remove(&key).await {
                                warn!(segment, error = %e, "Failed to remove merged key");
                            }
                        }
                    }
                }
            }
        }

        // Owners drop state stamped below their installed topology, and the
        // merged topology is usually superseded by the time merging ends.
        let push_topology_id = self.topology.current_topology_id().max(info.topology_id);
        for (owner, by_segment) in pushes {
            self.push(&owner, push_topology_id, by_segment).await;
        }

        self.keys_merged.fetch_add(merged_keys, Ordering::Relaxed);
        info!(merged_keys, "Conflict resolution finished");
    }

    async fn push(
        &self,
        owner: &Address,
        topology_id: TopologyId,
        by_segment: BTreeMap<SegmentId, Vec<InternalEntry>>,
    ) {
        if *owner == self.local {
            for entry in by_segment.into_values().flatten() {
                if let Err(e) = self.container.put(entry).await {
                    warn!(error = %e, "Failed to write merged entry");
                }
            }
            return;
        }

        let chunks: Vec<StateChunk> = by_segment
            .into_iter()
            .flat_map(|(segment, entries)| StateChunk::split(segment, entries, self.chunk_size))
            .collect();
        let response = StateResponseCommand::push(self.cache_name.clone(), topology_id, chunks);
        if let Err(e) = self.transport.send(owner, response.into()).await {
            warn!(%owner, error = %e, "Failed to push merged entries");
        }
    }
}

/// Group copies per key: `(key, preferred copy, other copies)`.
fn group_by_key(
    copies: HashMap<Address, Vec<InternalEntry>>,
    preferred_owner: Option<&Address>,
) -> Vec<(Bytes, Option<InternalEntry>, Vec<InternalEntry>)> {
    let mut by_key: BTreeMap<Bytes, (Option<InternalEntry>, Vec<InternalEntry>)> = BTreeMap::new();
    let mut origins: Vec<Address> = copies.keys().cloned().collect();
    origins.sort();

    let mut copies = copies;
    for origin in origins {
        let is_preferred = preferred_owner == Some(&origin);
        for entry in copies.remove(&origin).unwrap_or_default() {
            let slot = by_key.entry(entry.key.clone()).or_default();
            if is_preferred {
                slot.0 = Some(entry);
            } else if !slot.1.contains(&entry) {
                slot.1.push(entry);
            }
        }
    }

    by_key
        .into_iter()
        .map(|(key, (preferred, others))| (key, preferred, others))
        .collect()
}

/// Conflict manager pulling every copy to the coordinator.
pub struct DefaultConflictManager {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DefaultConflictManager {
    /// Create a new manager.
    pub fn new(
        cache_name: impl Into<String>,
        policy: MergePolicy,
        timeout: Duration,
        chunk_size: usize,
        transport: Arc<dyn StateTransport>,
        container: Arc<dyn DataContainer>,
        topology: Arc<TopologyHolder>,
    ) -> Self {
        let inner = Inner {
            cache_name: cache_name.into(),
            local: transport.local_address().clone(),
            policy,
            timeout,
            chunk_size,
            transport,
            container,
            topology,
            sessions: Mutex::new(HashMap::new()),
            keys_merged: AtomicU64::new(0),
        };
        Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Number of keys whose copies diverged and were merged.
    pub fn keys_merged(&self) -> u64 {
        self.inner.keys_merged.load(Ordering::Relaxed)
    }

    /// Whether a resolution is collecting state.
    pub fn is_resolving(&self) -> bool {
        !self.inner.sessions.lock().is_empty()
    }

    /// Wait for every started resolution to finish.
    pub async fn wait_for_completion(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(cache = %self.inner.cache_name, error = %e, "Conflict resolution task failed");
            }
        }
    }
}

impl ConflictManager for DefaultConflictManager {
    fn state_receiver(&self) -> Arc<dyn StateReceiver> {
        Arc::clone(&self.inner) as Arc<dyn StateReceiver>
    }

    fn resolve_conflicts(&self, merge_info: MergeInfo) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(cache = %self.inner.cache_name, "No runtime available, skipping conflict resolution");
                return;
            }
        };
        let inner = Arc::clone(&self.inner);
        let task = handle.spawn(async move { inner.resolve(merge_info).await });
        self.tasks.lock().push(task);
    }
}

impl std::fmt::Debug for DefaultConflictManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultConflictManager")
            .field("cache_name", &self.inner.cache_name)
            .field("policy", &self.inner.policy)
            .field("keys_merged", &self.keys_merged())
            .finish()
    }
}
