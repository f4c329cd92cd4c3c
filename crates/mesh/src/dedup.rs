//! Deduplication index
//!
//! Single source of truth for "have we already accepted this content?".
//! Entries are keyed by content hash and keep the closest-to-origin copy
//! seen so far. All access goes through one mutex, so for any content hash
//! exactly one observation returns [`Observation::New`].
//!
//! Capacity is bounded. When full, expired entries are pruned first, then the
//! oldest entry is evicted, skipping entries pinned by a pending upload.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;

use crate::packet::{ContentHash, SosPacket};

/// Dedup index errors
#[derive(Debug, Error)]
pub enum DedupError {
    /// The index lock was poisoned by a panicking holder
    #[error("Dedup index unavailable: {0}")]
    Unavailable(String),

    /// Every entry is pinned by a pending upload
    #[error("Dedup index saturated: all {capacity} entries await upload")]
    Saturated {
        /// Configured entry budget
        capacity: usize,
    },
}

/// Outcome of observing a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Content never seen; the packet is now recorded
    New,
    /// Seen before with an equal or lower hop count; discard
    DuplicateWorse,
    /// Seen before, but this copy is closer to the origin; the record is
    /// updated, the packet is still not relayed again
    DuplicateBetter,
}

/// Observation plus whether the packet should go to the upload bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserveOutcome {
    /// Dedup decision
    pub observation: Observation,
    /// The entry is now pinned for upload
    pub upload: bool,
}

/// Index entry for one content hash.
#[derive(Debug, Clone)]
pub struct DedupEntry {
    /// When this content was first accepted (Unix epoch milliseconds)
    pub first_seen_ms: u64,
    /// Lowest-hop copy seen so far
    pub best_known: Arc<SosPacket>,
    /// Number of times the content has been observed
    pub occurrence_count: u64,
    /// Pinned: an upload for this content has not finished
    pub upload_pending: bool,
    /// Backend receipt is known
    pub acknowledged: bool,
}

impl DedupEntry {
    fn mark_acknowledged(&mut self) {
        self.acknowledged = true;
        self.best_known = Arc::new(self.best_known.acknowledged());
    }
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<ContentHash, DedupEntry>,
    /// Content hashes in first-seen order
    arrival: VecDeque<ContentHash>,
}

/// Bounded, thread-safe dedup index.
#[derive(Debug)]
pub struct DedupIndex {
    state: Mutex<IndexState>,
    capacity: usize,
    retention_ms: u64,
}

impl DedupIndex {
    /// Create an index holding at most `capacity` entries, each remembered
    /// for `retention_ms` after it was first seen.
    pub fn new(capacity: usize, retention_ms: u64) -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            capacity: capacity.max(1),
            retention_ms,
        }
    }

    /// Record `packet` without pinning it for upload.
    pub fn observe(&self, packet: &Arc<SosPacket>, now_ms: u64) -> Result<Observation, DedupError> {
        self.record(packet, false, now_ms)
            .map(|outcome| outcome.observation)
    }

    /// Record `packet` and pin the entry when it should be uploaded.
    ///
    /// `New` content is always pinned; a `DuplicateBetter` copy is pinned
    /// only while the backend has not acknowledged the content.
    pub fn observe_for_upload(
        &self,
        packet: &Arc<SosPacket>,
        now_ms: u64,
    ) -> Result<ObserveOutcome, DedupError> {
        self.record(packet, true, now_ms)
    }

    fn record(
        &self,
        packet: &Arc<SosPacket>,
        hold_for_upload: bool,
        now_ms: u64,
    ) -> Result<ObserveOutcome, DedupError> {
        let mut state = self.lock()?;

        if let Some(entry) = state.entries.get_mut(&packet.content_hash) {
            entry.occurrence_count += 1;
            if packet.hop_count < entry.best_known.hop_count {
                entry.best_known = if entry.acknowledged {
                    Arc::new(packet.acknowledged())
                } else {
                    Arc::clone(packet)
                };
                let upload = hold_for_upload && !entry.acknowledged;
                if upload {
                    entry.upload_pending = true;
                }
                return Ok(ObserveOutcome {
                    observation: Observation::DuplicateBetter,
                    upload,
                });
            }
            return Ok(ObserveOutcome {
                observation: Observation::DuplicateWorse,
                upload: false,
            });
        }

        self.make_room(&mut state, now_ms)?;
        state.entries.insert(
            packet.content_hash,
            DedupEntry {
                first_seen_ms: now_ms,
                best_known: Arc::clone(packet),
                occurrence_count: 1,
                upload_pending: hold_for_upload,
                acknowledged: false,
            },
        );
        state.arrival.push_back(packet.content_hash);

        Ok(ObserveOutcome {
            observation: Observation::New,
            upload: hold_for_upload,
        })
    }

    fn make_room(&self, state: &mut IndexState, now_ms: u64) -> Result<(), DedupError> {
        if state.entries.len() < self.capacity {
            return Ok(());
        }
        self.prune_locked(state, now_ms);
        if state.entries.len() < self.capacity {
            return Ok(());
        }

        let entries = &state.entries;
        let victim = state
            .arrival
            .iter()
            .position(|hash| entries.get(hash).map_or(true, |e| !e.upload_pending));
        match victim {
            Some(pos) => {
                if let Some(hash) = state.arrival.remove(pos) {
                    state.entries.remove(&hash);
                    debug!(content_hash = %hash.short(), "Evicted oldest dedup entry");
                }
                Ok(())
            }
            None => Err(DedupError::Saturated {
                capacity: self.capacity,
            }),
        }
    }

    /// Drop entries older than the retention window that are not pinned.
    pub fn prune_expired(&self, now_ms: u64) -> Result<usize, DedupError> {
        let mut state = self.lock()?;
        Ok(self.prune_locked(&mut state, now_ms))
    }

    fn prune_locked(&self, state: &mut IndexState, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        let before = state.entries.len();
        let IndexState { entries, arrival } = state;
        arrival.retain(|hash| {
            let expired = match entries.get(hash) {
                Some(entry) => entry.first_seen_ms < cutoff && !entry.upload_pending,
                None => return false,
            };
            if expired {
                entries.remove(hash);
            }
            !expired
        });
        before - entries.len()
    }

    /// Unpin an entry once its upload finished. `acknowledged` records a
    /// successful delivery; `false` means the upload was abandoned.
    pub fn release_upload(&self, hash: &ContentHash, acknowledged: bool) -> Result<(), DedupError> {
        let mut state = self.lock()?;
        if let Some(entry) = state.entries.get_mut(hash) {
            entry.upload_pending = false;
            if acknowledged && !entry.acknowledged {
                entry.mark_acknowledged();
            }
        }
        Ok(())
    }

    /// Mark content as acknowledged by a peer that reached the backend.
    ///
    /// Returns `true` if the content is known and was not already
    /// acknowledged.
    pub fn acknowledge(&self, hash: &ContentHash) -> Result<bool, DedupError> {
        let mut state = self.lock()?;
        match state.entries.get_mut(hash) {
            Some(entry) if !entry.acknowledged => {
                entry.mark_acknowledged();
                entry.upload_pending = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Snapshot of one entry.
    pub fn get(&self, hash: &ContentHash) -> Result<Option<DedupEntry>, DedupError> {
        Ok(self.lock()?.entries.get(hash).cloned())
    }

    /// Whether `hash` is currently remembered.
    pub fn contains(&self, hash: &ContentHash) -> Result<bool, DedupError> {
        Ok(self.lock()?.entries.contains_key(hash))
    }

    /// Number of remembered content hashes.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured entry budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexState>, DedupError> {
        self.state
            .lock()
            .map_err(|e| DedupError::Unavailable(format!("Lock error: {}", e)))
    }

    /// Poison the index lock, simulating a crashed holder.
    #[cfg(test)]
    pub(crate) fn poison(&self) {
        std::thread::scope(|scope| {
            let _ = scope
                .spawn(|| {
                    let _guard = self.state.lock();
                    panic!("poisoning dedup index for test");
                })
                .join();
        });
    }
}
