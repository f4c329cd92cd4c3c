//! Emergency threads
//!
//! A thread groups an initial SOS with the updates its sender issues later.
//! History keeps the newest [`MAX_THREAD_HISTORY`] packets by origination
//! time; the "current" view is the latest of them, so out-of-order arrival
//! cannot roll a position back.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::packet::{AckState, ContentHash, Location, NodeId, SosPacket, ThreadId, Urgency};

/// Packets kept per thread; older ones are dropped first.
pub const MAX_THREAD_HISTORY: usize = 64;

/// Threads are scoped to their sender; another sender reusing a thread id
/// starts a separate thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ThreadKey {
    /// Sender that owns the thread
    pub sender_id: NodeId,
    /// Thread identifier carried by the packets
    pub thread_id: ThreadId,
}

impl ThreadKey {
    /// Key of the thread `packet` belongs to.
    pub fn of(packet: &SosPacket) -> Self {
        Self {
            sender_id: packet.sender_id.clone(),
            thread_id: packet.thread_id.clone(),
        }
    }
}

/// How a packet changed the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadUpdate {
    /// First packet of a new thread
    Started,
    /// Added to an existing thread's history
    Extended,
    /// A closer-to-origin copy replaced the stored one
    Refreshed,
}

/// One logical emergency.
#[derive(Debug, Clone)]
pub struct EmergencyThread {
    key: ThreadKey,
    /// Packets ordered by origination timestamp
    history: Vec<Arc<SosPacket>>,
    last_activity_ms: u64,
}

impl EmergencyThread {
    /// Thread key.
    pub fn key(&self) -> &ThreadKey {
        &self.key
    }

    /// Every packet of the thread, oldest first.
    pub fn history(&self) -> &[Arc<SosPacket>] {
        &self.history
    }

    /// Most recently originated packet.
    pub fn current(&self) -> Option<&Arc<SosPacket>> {
        self.history.last()
    }

    /// Latest known position: the newest packet that carried one.
    pub fn current_location(&self) -> Option<&Location> {
        self.history.iter().rev().find_map(|p| p.location.as_ref())
    }

    /// Highest urgency ever reported on the thread.
    pub fn peak_urgency(&self) -> Option<Urgency> {
        self.history.iter().map(|p| p.urgency).max()
    }

    /// Last time a packet of this thread was accepted.
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    fn position_of(&self, hash: &ContentHash) -> Option<usize> {
        self.history.iter().position(|p| p.content_hash == *hash)
    }

    fn insert_ordered(&mut self, packet: Arc<SosPacket>) {
        let at = self
            .history
            .partition_point(|p| p.origination_timestamp <= packet.origination_timestamp);
        self.history.insert(at, packet);
        if self.history.len() > MAX_THREAD_HISTORY {
            let excess = self.history.len() - MAX_THREAD_HISTORY;
            self.history.drain(..excess);
        }
    }
}

/// Serializable summary of a thread.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    /// Thread key
    pub key: ThreadKey,
    /// Number of packets in the history
    pub packets: usize,
    /// Latest known position
    pub current_location: Option<Location>,
    /// Highest urgency reported
    pub peak_urgency: Option<Urgency>,
    /// Last activity (Unix epoch milliseconds)
    pub last_activity_ms: u64,
}

/// Bounded registry of emergency threads.
#[derive(Debug)]
pub struct ThreadRegistry {
    threads: HashMap<ThreadKey, EmergencyThread>,
    capacity: usize,
}

impl ThreadRegistry {
    /// Create a registry tracking at most `capacity` threads.
    pub fn new(capacity: usize) -> Self {
        Self {
            threads: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an accepted packet.
    pub fn record(&mut self, packet: &Arc<SosPacket>, now_ms: u64) -> ThreadUpdate {
        let key = ThreadKey::of(packet);

        if let Some(thread) = self.threads.get_mut(&key) {
            thread.last_activity_ms = now_ms;
            return match thread.position_of(&packet.content_hash) {
                Some(idx) => {
                    let stored = &thread.history[idx];
                    if packet.hop_count < stored.hop_count {
                        thread.history[idx] = if stored.ack_state == AckState::Acknowledged {
                            Arc::new(packet.acknowledged())
                        } else {
                            Arc::clone(packet)
                        };
                    }
                    ThreadUpdate::Refreshed
                }
                None => {
                    thread.insert_ordered(Arc::clone(packet));
                    ThreadUpdate::Extended
                }
            };
        }

        if self.threads.len() >= self.capacity {
            self.evict_stalest();
        }
        self.threads.insert(
            key.clone(),
            EmergencyThread {
                key,
                history: vec![Arc::clone(packet)],
                last_activity_ms: now_ms,
            },
        );
        ThreadUpdate::Started
    }

    fn evict_stalest(&mut self) {
        if let Some(stalest) = self
            .threads
            .values()
            .min_by_key(|t| t.last_activity_ms)
            .map(|t| t.key.clone())
        {
            self.threads.remove(&stalest);
        }
    }

    /// Record a backend receipt on the stored copy of `hash`.
    ///
    /// Returns `false` if the thread or packet is no longer tracked.
    pub fn acknowledge(&mut self, key: &ThreadKey, hash: &ContentHash) -> bool {
        let Some(thread) = self.threads.get_mut(key) else {
            return false;
        };
        let Some(idx) = thread.position_of(hash) else {
            return false;
        };
        if thread.history[idx].ack_state != AckState::Acknowledged {
            thread.history[idx] = Arc::new(thread.history[idx].acknowledged());
        }
        true
    }

    /// Look up a thread.
    pub fn get(&self, key: &ThreadKey) -> Option<&EmergencyThread> {
        self.threads.get(key)
    }

    /// Summaries of every tracked thread, most recently active first.
    pub fn summaries(&self) -> Vec<ThreadSummary> {
        let mut summaries: Vec<ThreadSummary> = self
            .threads
            .values()
            .map(|t| ThreadSummary {
                key: t.key.clone(),
                packets: t.history.len(),
                current_location: t.current_location().cloned(),
                peak_urgency: t.peak_urgency(),
                last_activity_ms: t.last_activity_ms,
            })
            .collect();
        summaries.sort_by(|a, b| b.last_activity_ms.cmp(&a.last_activity_ms));
        summaries
    }

    /// Number of tracked threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no thread is tracked.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}
