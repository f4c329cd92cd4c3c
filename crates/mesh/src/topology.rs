//! Neighbour table
//!
//! Tracks the nodes this node hears directly: the last hop of every
//! decoded inbound packet, the transports it was heard on, and a
//! reliability score. Packets that bring new content raise the score,
//! packets dropped by the flood limiter lower it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::packet::{NodeId, SosPacket};
use crate::transport::TransportId;

/// Neighbours heard within this window count as active.
pub const ACTIVE_WINDOW_MS: u64 = 300_000;

/// Most neighbours remembered; the stalest is dropped first.
pub const MAX_NEIGHBORS: usize = 256;

const RELIABILITY_STEP: f64 = 0.1;
const RELIABILITY_FLOOR: f64 = 0.1;

/// What a packet from a neighbour contributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    /// New content, or a closer copy of known content
    Useful,
    /// Content already known
    Redundant,
    /// Dropped by the flood limiter
    Refused,
}

#[derive(Debug, Clone)]
struct Neighbor {
    transports: BTreeSet<TransportId>,
    last_seen_ms: u64,
    packets_heard: u64,
    reliability: f64,
}

/// Serializable view of one neighbour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborSummary {
    /// Neighbour identity
    pub node_id: NodeId,
    /// Transports it was heard on
    pub transports: Vec<TransportId>,
    /// Last time it was heard (Unix epoch milliseconds)
    pub last_seen_ms: u64,
    /// Decoded packets heard from it
    pub packets_heard: u64,
    /// Score in `0.1..=1.0`
    pub reliability: f64,
}

/// Bounded table of directly heard nodes.
#[derive(Debug, Default)]
pub struct NeighborTable {
    neighbors: HashMap<NodeId, Neighbor>,
}

/// Node that transmitted `packet` to us: the last relay, or the sender for
/// a packet heard at hop 0.
pub fn last_hop(packet: &SosPacket) -> &str {
    packet.relay_path.last().unwrap_or(&packet.sender_id)
}

impl NeighborTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet heard from `node_id` on `transport`.
    pub fn observe(&mut self, node_id: &str, transport: &str, contribution: Contribution, now_ms: u64) {
        if !self.neighbors.contains_key(node_id) && self.neighbors.len() >= MAX_NEIGHBORS {
            self.evict_stalest();
        }
        let neighbor = self
            .neighbors
            .entry(node_id.to_string())
            .or_insert_with(|| Neighbor {
                transports: BTreeSet::new(),
                last_seen_ms: now_ms,
                packets_heard: 0,
                reliability: 1.0,
            });
        neighbor.transports.insert(transport.to_string());
        neighbor.last_seen_ms = neighbor.last_seen_ms.max(now_ms);
        neighbor.packets_heard += 1;
        neighbor.reliability = match contribution {
            Contribution::Useful => (neighbor.reliability + RELIABILITY_STEP).min(1.0),
            Contribution::Redundant => neighbor.reliability,
            Contribution::Refused => (neighbor.reliability - RELIABILITY_STEP).max(RELIABILITY_FLOOR),
        };
    }

    fn evict_stalest(&mut self) {
        if let Some(stalest) = self
            .neighbors
            .iter()
            .min_by_key(|(_, n)| n.last_seen_ms)
            .map(|(id, _)| id.clone())
        {
            self.neighbors.remove(&stalest);
        }
    }

    /// Neighbours heard within [`ACTIVE_WINDOW_MS`], most recent first.
    pub fn active(&self, now_ms: u64) -> Vec<NeighborSummary> {
        let cutoff = now_ms.saturating_sub(ACTIVE_WINDOW_MS);
        let mut active: Vec<NeighborSummary> = self
            .neighbors
            .iter()
            .filter(|(_, n)| n.last_seen_ms >= cutoff)
            .map(|(id, n)| NeighborSummary {
                node_id: id.clone(),
                transports: n.transports.iter().cloned().collect(),
                last_seen_ms: n.last_seen_ms,
                packets_heard: n.packets_heard,
                reliability: n.reliability,
            })
            .collect();
        active.sort_by(|a, b| {
            b.last_seen_ms
                .cmp(&a.last_seen_ms)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        active
    }

    /// Forget neighbours not heard within the active window.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(ACTIVE_WINDOW_MS);
        let before = self.neighbors.len();
        self.neighbors.retain(|_, n| n.last_seen_ms >= cutoff);
        before - self.neighbors.len()
    }

    /// Number of neighbours remembered.
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    /// Whether no neighbour is remembered.
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}
