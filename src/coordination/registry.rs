//! Peer registry: last-known state of every other vehicle
//!
//! Owned by a single vehicle node and only touched from its tick loop.
//! Records are kept in a lane/position index so snapshots come out ordered
//! for leader and follower lookups.

use log::{debug, info, trace};
use ordered_float::OrderedFloat;
use sorted_vec::SortedVec;
use std::collections::HashMap;

use super::error::StalePeer;
use super::topology::Track;
use super::types::{Heading, Lane, VehicleId, VehicleState};

/// Last-known state of one peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub state: VehicleState,
    /// Local clock (ms) when the current state was accepted
    pub received_at_ms: u64,
    /// Eviction passes survived since the last accepted update
    pub staleness: u32,
}

/// Result of offering a state to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First message from this identifier
    Inserted,
    /// Strictly newer than the stored state
    Updated,
    /// Older than or as old as the stored state; ignored
    Discarded,
}

/// Index key ordering peers by lane, then position, then id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct LaneSlot {
    lane: Lane,
    position: OrderedFloat<f32>,
    id: VehicleId,
}

impl LaneSlot {
    fn of(state: &VehicleState) -> Self {
        Self {
            lane: state.lane,
            position: OrderedFloat(state.position),
            id: state.id.clone(),
        }
    }
}

pub struct PeerRegistry {
    track: Track,

    /// Records keyed by sender
    peers: HashMap<VehicleId, PeerRecord>,

    /// Sorted (lane, position, id) index over `peers`
    index: SortedVec<LaneSlot>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new(Track::default())
    }
}

impl PeerRegistry {
    pub fn new(track: Track) -> Self {
        Self {
            track,
            peers: HashMap::new(),
            index: SortedVec::new(),
        }
    }

    /// Offer a decoded state. Only a strictly newer timestamp replaces the
    /// stored one, so duplicate and late deliveries leave the registry as is.
    pub fn upsert(&mut self, mut state: VehicleState, now_ms: u64) -> UpsertOutcome {
        state.position = self.track.wrap(state.position);

        match self.peers.get_mut(&state.id) {
            Some(record) if state.timestamp_ms <= record.state.timestamp_ms => {
                trace!(
                    "Discarding telemetry from {} at {} (have {})",
                    state.id,
                    state.timestamp_ms,
                    record.state.timestamp_ms
                );
                UpsertOutcome::Discarded
            }
            Some(record) => {
                self.index.remove_item(&LaneSlot::of(&record.state));
                self.index.insert(LaneSlot::of(&state));
                record.state = state;
                record.received_at_ms = now_ms;
                record.staleness = 0;
                UpsertOutcome::Updated
            }
            None => {
                info!("Peer {} joined in lane {}", state.id, state.lane);
                self.index.insert(LaneSlot::of(&state));
                self.peers.insert(
                    state.id.clone(),
                    PeerRecord {
                        state,
                        received_at_ms: now_ms,
                        staleness: 0,
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Drop every peer silent for longer than `timeout_ms`
    pub fn evict_stale(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<StalePeer> {
        let stale_ids: Vec<VehicleId> = self
            .peers
            .iter()
            .filter(|(_, record)| now_ms.saturating_sub(record.received_at_ms) > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(record) = self.peers.remove(&id) {
                self.index.remove_item(&LaneSlot::of(&record.state));
                let silent_for_ms = now_ms.saturating_sub(record.received_at_ms);
                info!("Peer {} evicted after {}ms without telemetry", id, silent_for_ms);
                evicted.push(StalePeer { id, silent_for_ms });
            }
        }

        for record in self.peers.values_mut() {
            if record.received_at_ms < now_ms {
                record.staleness = record.staleness.saturating_add(1);
            }
        }

        if !evicted.is_empty() {
            debug!("{} peers remain after eviction", self.peers.len());
        }

        evicted
    }

    /// Ordered view of all peers: by lane, then ascending position
    pub fn snapshot(&self) -> PeerSnapshot<'_> {
        let records = self
            .index
            .iter()
            .filter_map(|slot| self.peers.get(&slot.id))
            .collect();

        PeerSnapshot {
            track: self.track,
            records,
        }
    }

    pub fn get(&self, id: &VehicleId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &VehicleId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// A peer found next to a position, with the gap to it
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<'a> {
    pub gap: f32,
    pub record: &'a PeerRecord,
}

/// Read-only, ordered view of the registry for one tick
#[derive(Debug, Clone)]
pub struct PeerSnapshot<'a> {
    track: Track,
    records: Vec<&'a PeerRecord>,
}

impl<'a> PeerSnapshot<'a> {
    pub fn track(&self) -> Track {
        self.track
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a PeerRecord> + '_ {
        self.records.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &VehicleId) -> Option<&'a PeerRecord> {
        self.iter().find(|record| &record.state.id == id)
    }

    /// Peers in `lane`, in ascending position
    pub fn lane(&self, lane: Lane) -> &[&'a PeerRecord] {
        let start = self.records.partition_point(|r| r.state.lane < lane);
        let end = self.records.partition_point(|r| r.state.lane <= lane);
        &self.records[start..end]
    }

    /// Nearest peer in `lane` ahead of `position` when travelling with `heading`
    pub fn nearest_ahead(&self, lane: Lane, position: f32, heading: Heading) -> Option<Neighbor<'a>> {
        let peers = self.lane(lane);
        let n = peers.len();
        if n == 0 {
            return None;
        }

        let record = match heading {
            Heading::Forward => {
                let idx = peers.partition_point(|r| r.state.position < position);
                peers[idx % n]
            }
            Heading::Reverse => {
                let idx = peers.partition_point(|r| r.state.position <= position);
                peers[(idx + n - 1) % n]
            }
        };

        Some(Neighbor {
            gap: self.track.gap_ahead(position, record.state.position, heading),
            record,
        })
    }

    /// Nearest peer in `lane` behind `position` when travelling with `heading`
    pub fn nearest_behind(&self, lane: Lane, position: f32, heading: Heading) -> Option<Neighbor<'a>> {
        let peers = self.lane(lane);
        let n = peers.len();
        if n == 0 {
            return None;
        }

        let record = match heading {
            Heading::Forward => {
                let idx = peers.partition_point(|r| r.state.position < position);
                peers[(idx + n - 1) % n]
            }
            Heading::Reverse => {
                let idx = peers.partition_point(|r| r.state.position <= position);
                peers[idx % n]
            }
        };

        Some(Neighbor {
            gap: self.track.gap_ahead(record.state.position, position, heading),
            record,
        })
    }

    /// Mean speed of the peers in `lane`
    pub fn prevailing_speed(&self, lane: Lane) -> Option<f32> {
        let peers = self.lane(lane);
        if peers.is_empty() {
            return None;
        }
        let total: f32 = peers.iter().map(|r| r.state.speed).sum();
        Some(total / peers.len() as f32)
    }
}
