//! Operator-visible topology events.
//!
//! Strategy handlers never return errors; data loss and partition warnings
//! are reported through a [`TopologyEventListener`].

use crate::partition::context::AvailabilityMode;
use crate::types::{Address, SegmentSet, TopologyId};

/// Severity of a topology event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventLevel {
    Info,
    Warn,
    Fatal,
}

/// Events raised while handling membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A graceful leave removed the last copy of some segments.
    DataLostGracefulLeave {
        cache: String,
        leaver: Address,
        lost_segments: SegmentSet,
    },

    /// Members left abruptly and took the last copy of some segments.
    DataLostAbruptLeave {
        cache: String,
        lost_members: Vec<Address>,
    },

    /// At least half of the stable members are gone.
    MinorityPartition {
        cache: String,
        new_members: Vec<Address>,
        lost_members: Vec<Address>,
        stable_members: Vec<Address>,
    },

    /// A healed split was handed to conflict resolution.
    ConflictResolutionStarted {
        cache: String,
        topology_id: TopologyId,
        preferred_members: Vec<Address>,
    },

    /// The availability mode changed.
    AvailabilityModeChanged {
        cache: String,
        mode: AvailabilityMode,
    },

    /// The cache has no members left.
    NoMembers { cache: String },
}

impl TopologyEvent {
    /// Severity of this event.
    pub fn level(&self) -> EventLevel {
        match self {
            TopologyEvent::DataLostAbruptLeave { .. } => EventLevel::Fatal,
            TopologyEvent::DataLostGracefulLeave { .. }
            | TopologyEvent::MinorityPartition { .. } => EventLevel::Warn,
            TopologyEvent::AvailabilityModeChanged { mode, .. } => match mode {
                AvailabilityMode::DegradedMode => EventLevel::Warn,
                AvailabilityMode::Available => EventLevel::Info,
            },
            TopologyEvent::ConflictResolutionStarted { .. } | TopologyEvent::NoMembers { .. } => {
                EventLevel::Info
            }
        }
    }

    /// Name of the cache the event refers to.
    pub fn cache_name(&self) -> &str {
        match self {
            TopologyEvent::DataLostGracefulLeave { cache, .. }
            | TopologyEvent::DataLostAbruptLeave { cache, .. }
            | TopologyEvent::MinorityPartition { cache, .. }
            | TopologyEvent::ConflictResolutionStarted { cache, .. }
            | TopologyEvent::AvailabilityModeChanged { cache, .. }
            | TopologyEvent::NoMembers { cache } => cache,
        }
    }
}

/// Receives topology events.
pub trait TopologyEventListener: Send + Sync + 'static {
    /// Called for every event.
    fn on_event(&self, event: &TopologyEvent);
}

/// Drops every event.
pub struct NoopEventListener;

impl TopologyEventListener for NoopEventListener {
    fn on_event(&self, _event: &TopologyEvent) {}
}

/// Logs events through `tracing`, fatal events at error level.
pub struct LoggingEventListener;

impl TopologyEventListener for LoggingEventListener {
    fn on_event(&self, event: &TopologyEvent) {
        match event {
            TopologyEvent::DataLostGracefulLeave {
                cache,
                leaver,
                lost_segments,
            } => {
                tracing::warn!(
                    cache = %cache,
                    %leaver,
                    lost = lost_segments.len(),
                    "Data lost due to graceful leave"
                );
            }
            TopologyEvent::DataLostAbruptLeave {
                cache,
                lost_members,
            } => {
                tracing::error!(cache = %cache, ?lost_members, "Abrupt leavers caused data loss");
            }
            TopologyEvent::MinorityPartition {
                cache,
                new_members,
                lost_members,
                stable_members,
            } => {
                tracing::warn!(
                    cache = %cache,
                    ?new_members,
                    ?lost_members,
                    ?stable_members,
                    "Cache may be in a minority partition"
                );
            }
            TopologyEvent::ConflictResolutionStarted {
                cache,
                topology_id,
                preferred_members,
            } => {
                tracing::info!(
                    cache = %cache,
                    topology_id,
                    ?preferred_members,
                    "Conflict resolution started after merge"
                );
            }
            TopologyEvent::AvailabilityModeChanged { cache, mode } => {
                if event.level() == EventLevel::Warn {
                    tracing::warn!(cache = %cache, ?mode, "Availability mode changed");
                } else {
                    tracing::info!(cache = %cache, ?mode, "Availability mode changed");
                }
            }
            TopologyEvent::NoMembers { cache } => {
                tracing::info!(cache = %cache, "Cache no longer has any members");
            }
        }
    }
}
