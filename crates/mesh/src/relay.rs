//! Relay engine
//!
//! Central decision point for every packet a node originates or overhears.
//!
//! ```text
//! Received ──► Rejected(malformed | rate limited | duplicate)
//!          └─► Accepted ──► Forwarding ──► Forwarded
//!                       └─► TtlExhausted (uploaded, never relayed)
//! ```
//!
//! The decide step is synchronous: validation, dedup, thread bookkeeping
//! and upload submission never await. Transport sends are handed to the
//! [`FanoutCoordinator`], which runs them concurrently in the background.
//!
//! If the dedup index cannot answer, the engine fails closed: the packet is
//! rejected and nothing is broadcast.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

use sonicwave_core::RelayConfig;

use crate::dedup::{DedupError, DedupIndex, Observation, ObserveOutcome};
use crate::error::{MeshError, MeshResult};
use crate::fanout::{BroadcastTicket, FanoutCoordinator};
use crate::flood::FloodLimiter;
use crate::packet::{
    ContentHash, NodeId, PacketError, PacketId, PacketType, SosPacket, SosRequest, ThreadId,
    Urgency,
};
use crate::thread::{EmergencyThread, ThreadKey, ThreadRegistry, ThreadSummary};
use crate::topology::{last_hop, Contribution, NeighborSummary, NeighborTable};
use crate::transport::TransportId;
use crate::upload::{UploadEvent, UploadHandle, UploadHint};

/// What the engine did with an inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// New content, relay copy dispatched to the other transports
    Forwarded,
    /// New content with no hop budget left; uploaded, not relayed
    TtlExhausted,
    /// New content that already passed through this node
    Looped,
    /// Known content, closer to the origin than the stored copy
    BetterDuplicate,
    /// Known content
    Duplicate,
    /// Sender exceeded its new-packet budget
    RateLimited,
}

impl Disposition {
    /// Whether the packet was accepted as new content.
    pub fn is_accepted(self) -> bool {
        matches!(
            self,
            Disposition::Forwarded | Disposition::TtlExhausted | Disposition::Looped
        )
    }
}

/// Result of handling one inbound packet.
#[derive(Debug)]
pub struct RelayReport {
    /// Content the packet carried
    pub content_hash: ContentHash,
    /// Packet identifier
    pub packet_id: PacketId,
    /// Decision
    pub disposition: Disposition,
    /// Whether the packet was handed to the upload bridge
    pub uploaded: bool,
    /// In-progress relay broadcast, when forwarded
    pub broadcast: Option<BroadcastTicket>,
}

/// Local acknowledgement returned to the originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAck {
    /// New packet identifier
    pub packet_id: PacketId,
    /// Content digest
    pub content_hash: ContentHash,
    /// Thread the packet belongs to
    pub thread_id: ThreadId,
    /// Hop budget the packet starts with
    pub ttl_remaining: u32,
    /// Transports the packet was dispatched to
    pub targets: Vec<TransportId>,
}

/// Result of a local origination.
#[derive(Debug)]
pub struct Origination {
    /// Acknowledgement for the caller
    pub ack: LocalAck,
    /// The packet as broadcast
    pub packet: Arc<SosPacket>,
    /// In-progress broadcast
    pub broadcast: Option<BroadcastTicket>,
}

/// Result of a maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Dedup entries past retention that were dropped
    pub pruned_entries: usize,
    /// Idle senders dropped from the flood limiter
    pub idle_senders: usize,
    /// Neighbours not heard within the active window
    pub idle_neighbors: usize,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    originated: AtomicU64,
    accepted: AtomicU64,
    forwarded: AtomicU64,
    duplicates: AtomicU64,
    better_duplicates: AtomicU64,
    ttl_exhausted: AtomicU64,
    malformed: AtomicU64,
    rate_limited: AtomicU64,
    fail_closed: AtomicU64,
    acks_applied: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Packets received from transports
    pub received: u64,
    /// Packets originated locally
    pub originated: u64,
    /// Inbound packets accepted as new content
    pub accepted: u64,
    /// Relay copies dispatched
    pub forwarded: u64,
    /// Duplicates dropped
    pub duplicates: u64,
    /// Closer-to-origin duplicates recorded
    pub better_duplicates: u64,
    /// New packets that arrived with no hop budget left
    pub ttl_exhausted: u64,
    /// Structurally invalid packets dropped
    pub malformed: u64,
    /// Packets dropped by the flood limiter
    pub rate_limited: u64,
    /// Packets rejected because the dedup index was unavailable
    pub fail_closed: u64,
    /// Peer acknowledgements applied
    pub acks_applied: u64,
    /// Entries in the dedup index
    pub dedup_entries: usize,
    /// Tracked emergency threads
    pub threads: usize,
    /// Directly heard nodes still remembered
    pub neighbors: usize,
}

/// Relay and deduplication engine for one node.
#[derive(Debug)]
pub struct RelayEngine {
    node_id: NodeId,
    dedup: DedupIndex,
    threads: Mutex<ThreadRegistry>,
    limiter: Mutex<FloodLimiter>,
    neighbors: Mutex<NeighborTable>,
    fanout: Arc<FanoutCoordinator>,
    upload: Option<UploadHandle>,
    announce_acks: bool,
    counters: Counters,
}

fn recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayEngine {
    /// Create an engine for `node_id`. Without an upload handle the node
    /// relays only.
    pub fn new(
        node_id: impl Into<NodeId>,
        config: &RelayConfig,
        fanout: Arc<FanoutCoordinator>,
        upload: Option<UploadHandle>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            dedup: DedupIndex::new(config.dedup_capacity, config.retention_secs.saturating_mul(1000)),
            threads: Mutex::new(ThreadRegistry::new(config.thread_capacity)),
            limiter: Mutex::new(FloodLimiter::new(config.max_new_per_sender_per_minute)),
            neighbors: Mutex::new(NeighborTable::new()),
            fanout,
            upload,
            announce_acks: config.announce_acks,
            counters: Counters::default(),
        }
    }

    /// Identity appended to relay paths.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Dedup index.
    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    /// Fan-out coordinator.
    pub fn fanout(&self) -> &Arc<FanoutCoordinator> {
        &self.fanout
    }

    /// Handle one serialized packet received on transport `source`.
    pub fn handle_inbound(&self, bytes: &[u8], source: &str, now_ms: u64) -> MeshResult<RelayReport> {
        bump(&self.counters.received);

        let packet = match SosPacket::from_wire(bytes) {
            Ok(packet) => Arc::new(packet),
            Err(e) => {
                bump(&self.counters.malformed);
                warn!(transport = %source, "dropping malformed packet: {}", e);
                return Err(e.into());
            }
        };

        let report = |disposition: Disposition, uploaded: bool, broadcast: Option<BroadcastTicket>| RelayReport {
            content_hash: packet.content_hash,
            packet_id: packet.packet_id.clone(),
            disposition,
            uploaded,
            broadcast,
        };

        // Only new content counts against a sender's budget
        if !self.fail_closed(self.dedup.contains(&packet.content_hash))?
            && !recover(&self.limiter).admit(&packet.sender_id, packet.urgency, now_ms)
        {
            bump(&self.counters.rate_limited);
            self.note_neighbor(&packet, source, Contribution::Refused, now_ms);
            warn!(sender = %packet.sender_id, packet = %packet, "sender over flood limit, dropping");
            return Ok(report(Disposition::RateLimited, false, None));
        }

        let outcome = self.fail_closed(self.observe(&packet, now_ms))?;
        let contribution = match outcome.observation {
            Observation::DuplicateWorse => Contribution::Redundant,
            Observation::New | Observation::DuplicateBetter => Contribution::Useful,
        };
        self.note_neighbor(&packet, source, contribution, now_ms);

        match outcome.observation {
            Observation::DuplicateWorse => {
                bump(&self.counters.duplicates);
                debug!(transport = %source, packet = %packet, "duplicate dropped");
                Ok(report(Disposition::Duplicate, false, None))
            }
            Observation::DuplicateBetter => {
                bump(&self.counters.better_duplicates);
                recover(&self.threads).record(&packet, now_ms);
                let uploaded = outcome.upload && self.submit_upload(&packet);
                debug!(transport = %source, packet = %packet, "closer copy recorded, not relayed");
                Ok(report(Disposition::BetterDuplicate, uploaded, None))
            }
            Observation::New => {
                bump(&self.counters.accepted);
                recover(&self.threads).record(&packet, now_ms);
                if packet.packet_type == PacketType::Ack {
                    self.apply_peer_ack(&packet)?;
                }
                let uploaded = outcome.upload && self.submit_upload(&packet);

                if packet.is_terminal() {
                    bump(&self.counters.ttl_exhausted);
                    info!(transport = %source, packet = %packet, "hop budget exhausted, not relaying");
                    return Ok(report(Disposition::TtlExhausted, uploaded, None));
                }

                // The copy may carry ttl 0: its receivers accept and upload
                // it but relay no further
                match packet.derive_relay_copy(&self.node_id) {
                    Ok(copy) => {
                        let ticket = self.fanout.broadcast(&copy, Some(source))?;
                        bump(&self.counters.forwarded);
                        info!(
                            transport = %source,
                            packet = %copy,
                            targets = ticket.targets().len(),
                            "relaying"
                        );
                        Ok(report(Disposition::Forwarded, uploaded, Some(ticket)))
                    }
                    Err(PacketError::AlreadyRelayed { .. }) => {
                        debug!(packet = %packet, "packet already passed through this node");
                        Ok(report(Disposition::Looped, uploaded, None))
                    }
                    Err(PacketError::TtlExhausted { .. }) => {
                        bump(&self.counters.ttl_exhausted);
                        Ok(report(Disposition::TtlExhausted, uploaded, None))
                    }
                }
            }
        }
    }

    /// Originate a packet from this node and broadcast it on every
    /// transport.
    ///
    /// Succeeds locally regardless of transport or backend state; only
    /// invalid input or an unavailable dedup index is an error. Repeating
    /// content that is already known returns the stored packet's
    /// acknowledgement and broadcasts nothing.
    pub fn originate(&self, request: SosRequest, now_ms: u64) -> MeshResult<Origination> {
        let packet = Arc::new(SosPacket::originate(&self.node_id, request, now_ms)?);

        let outcome = self.fail_closed(self.observe(&packet, now_ms))?;
        if outcome.observation != Observation::New {
            let known = self
                .fail_closed(self.dedup.get(&packet.content_hash))?
                .map_or(packet, |entry| entry.best_known);
            debug!(packet = %known, "content already known, not broadcasting again");
            return Ok(Origination {
                ack: LocalAck {
                    packet_id: known.packet_id.clone(),
                    content_hash: known.content_hash,
                    thread_id: known.thread_id.clone(),
                    ttl_remaining: known.ttl_remaining,
                    targets: Vec::new(),
                },
                packet: known,
                broadcast: None,
            });
        }
        bump(&self.counters.originated);
        recover(&self.threads).record(&packet, now_ms);
        if outcome.upload {
            self.submit_upload(&packet);
        }

        let broadcast = match self.fanout.broadcast(&packet, None) {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                error!(packet = %packet, "broadcast of originated packet failed: {}", e);
                None
            }
        };
        let targets = broadcast
            .as_ref()
            .map(|t| t.targets().to_vec())
            .unwrap_or_default();
        info!(packet = %packet, targets = targets.len(), "originated");

        Ok(Origination {
            ack: LocalAck {
                packet_id: packet.packet_id.clone(),
                content_hash: packet.content_hash,
                thread_id: packet.thread_id.clone(),
                ttl_remaining: packet.ttl_remaining,
                targets,
            },
            packet,
            broadcast,
        })
    }

    /// Apply feedback from the upload bridge. A first successful delivery
    /// may originate an ACK packet announcing the receipt to the mesh.
    pub fn on_upload_event(&self, event: &UploadEvent, now_ms: u64) -> MeshResult<Option<Origination>> {
        match event {
            UploadEvent::Delivered {
                content_hash,
                packet,
            } => {
                let first_receipt = self.mark_acknowledged(content_hash)?;
                if !(first_receipt && self.announce_acks) {
                    return Ok(None);
                }
                let ack = SosRequest {
                    message: format!("received {}", content_hash.short()),
                    urgency: Urgency::Low,
                    packet_type: PacketType::Ack,
                    location: None,
                    thread_id: Some(packet.thread_id.clone()),
                    acknowledges: Some(*content_hash),
                };
                self.originate(ack, now_ms).map(Some)
            }
            UploadEvent::Abandoned {
                content_hash,
                reason,
            } => {
                debug!(content_hash = %content_hash.short(), reason = %reason, "releasing abandoned upload");
                self.fail_closed(self.dedup.release_upload(content_hash, false))?;
                Ok(None)
            }
        }
    }

    /// Retention pruning, limiter and neighbour housekeeping.
    pub fn maintain(&self, now_ms: u64) -> MeshResult<MaintenanceReport> {
        let pruned_entries = self.fail_closed(self.dedup.prune_expired(now_ms))?;
        let idle_senders = recover(&self.limiter).cleanup(now_ms);
        let idle_neighbors = recover(&self.neighbors).prune(now_ms);
        if pruned_entries > 0 || idle_senders > 0 || idle_neighbors > 0 {
            debug!(pruned_entries, idle_senders, idle_neighbors, "maintenance pass");
        }
        Ok(MaintenanceReport {
            pruned_entries,
            idle_senders,
            idle_neighbors,
        })
    }

    /// Neighbours heard recently, most recent first.
    pub fn neighbors(&self, now_ms: u64) -> Vec<NeighborSummary> {
        recover(&self.neighbors).active(now_ms)
    }

    /// Snapshot of a thread.
    pub fn thread(&self, key: &ThreadKey) -> Option<EmergencyThread> {
        recover(&self.threads).get(key).cloned()
    }

    /// Summaries of all tracked threads.
    pub fn thread_summaries(&self) -> Vec<ThreadSummary> {
        recover(&self.threads).summaries()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> RelayStats {
        let c = &self.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RelayStats {
            received: load(&c.received),
            originated: load(&c.originated),
            accepted: load(&c.accepted),
            forwarded: load(&c.forwarded),
            duplicates: load(&c.duplicates),
            better_duplicates: load(&c.better_duplicates),
            ttl_exhausted: load(&c.ttl_exhausted),
            malformed: load(&c.malformed),
            rate_limited: load(&c.rate_limited),
            fail_closed: load(&c.fail_closed),
            acks_applied: load(&c.acks_applied),
            dedup_entries: self.dedup.len(),
            threads: recover(&self.threads).len(),
            neighbors: recover(&self.neighbors).len(),
        }
    }

    fn observe(&self, packet: &Arc<SosPacket>, now_ms: u64) -> Result<ObserveOutcome, DedupError> {
        if self.upload.is_some() && packet.packet_type.is_reportable() {
            self.dedup.observe_for_upload(packet, now_ms)
        } else {
            self.dedup.observe(packet, now_ms).map(|observation| ObserveOutcome {
                observation,
                upload: false,
            })
        }
    }

    fn fail_closed<T>(&self, result: Result<T, DedupError>) -> MeshResult<T> {
        result.map_err(|e| {
            bump(&self.counters.fail_closed);
            error!("dedup index unavailable, rejecting packet: {}", e);
            MeshError::Dedup(e)
        })
    }

    fn note_neighbor(&self, packet: &SosPacket, source: &str, contribution: Contribution, now_ms: u64) {
        let neighbor = last_hop(packet);
        if neighbor != self.node_id {
            recover(&self.neighbors).observe(neighbor, source, contribution, now_ms);
        }
    }

    /// Record a backend receipt in the dedup index and on the thread
    /// history. Returns `true` on the first receipt for known content.
    fn mark_acknowledged(&self, hash: &ContentHash) -> MeshResult<bool> {
        if !self.fail_closed(self.dedup.acknowledge(hash))? {
            return Ok(false);
        }
        if let Some(entry) = self.fail_closed(self.dedup.get(hash))? {
            recover(&self.threads).acknowledge(&ThreadKey::of(&entry.best_known), hash);
        }
        Ok(true)
    }

    fn apply_peer_ack(&self, ack: &SosPacket) -> MeshResult<()> {
        let Some(target) = ack.acknowledges else {
            return Ok(());
        };
        if self.mark_acknowledged(&target)? {
            bump(&self.counters.acks_applied);
            info!(content_hash = %target.short(), from = %ack.sender_id, "peer reported backend receipt");
            if let Some(upload) = &self.upload {
                if let Err(e) = upload.cancel(target) {
                    warn!(content_hash = %target.short(), "could not cancel pending upload: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Hand `packet` to the bridge; on refusal the dedup pin is released
    /// so the entry stays evictable.
    fn submit_upload(&self, packet: &Arc<SosPacket>) -> bool {
        let Some(upload) = &self.upload else {
            return false;
        };
        match upload.submit(Arc::clone(packet), UploadHint::for_urgency(packet.urgency)) {
            Ok(()) => true,
            Err(e) => {
                warn!(packet = %packet, "upload submission refused: {}", e);
                if let Err(e) = self.dedup.release_upload(&packet.content_hash, false) {
                    error!("could not release upload pin: {}", e);
                }
                false
            }
        }
    }
}
