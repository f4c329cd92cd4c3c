//! Transport fan-out coordinator
//!
//! Sends one logical packet across every registered transport at once.
//! Each send runs on its own task under a timeout, so a stalled or failing
//! medium never delays the others or the caller. Results are aggregated in
//! the background and can be awaited through the returned ticket.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::packet::{ContentHash, SosPacket};
use crate::transport::{Transport, TransportError, TransportId, TransportKind};

/// Outcome of one transport send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendOutcome {
    /// Handed to the medium
    Delivered,
    /// Transport reported an error
    Failed {
        /// Error text
        reason: String,
    },
    /// Send did not finish within the timeout
    TimedOut,
}

/// Result for one transport in a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportResult {
    /// Transport the send went to
    pub transport_id: TransportId,
    /// What happened
    pub outcome: SendOutcome,
}

impl TransportResult {
    /// Whether the send was delivered.
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, SendOutcome::Delivered)
    }
}

/// Aggregated outcome of a broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastReport {
    /// Content that was broadcast
    pub content_hash: ContentHash,
    /// Per-transport results
    pub results: Vec<TransportResult>,
    /// Number of delivered sends
    pub delivered_count: usize,
    /// Number of failed sends
    pub failure_count: usize,
    /// Number of timed-out sends
    pub timeout_count: usize,
}

impl BroadcastReport {
    fn new(content_hash: ContentHash, results: Vec<TransportResult>) -> Self {
        let delivered_count = results.iter().filter(|r| r.is_delivered()).count();
        let failure_count = results
            .iter()
            .filter(|r| matches!(r.outcome, SendOutcome::Failed { .. }))
            .count();
        let timeout_count = results
            .iter()
            .filter(|r| matches!(r.outcome, SendOutcome::TimedOut))
            .count();
        Self {
            content_hash,
            results,
            delivered_count,
            failure_count,
            timeout_count,
        }
    }

    /// Number of transports targeted.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Whether every targeted transport accepted the packet.
    pub fn all_delivered(&self) -> bool {
        self.delivered_count == self.results.len()
    }
}

/// Handle on an in-progress broadcast.
#[derive(Debug)]
pub struct BroadcastTicket {
    content_hash: ContentHash,
    targets: Vec<TransportId>,
    aggregate: JoinHandle<BroadcastReport>,
}

impl BroadcastTicket {
    /// Transports the packet was dispatched to.
    pub fn targets(&self) -> &[TransportId] {
        &self.targets
    }

    /// Wait for every send to finish.
    pub async fn report(self) -> BroadcastReport {
        let content_hash = self.content_hash;
        let targets = self.targets;
        match self.aggregate.await {
            Ok(report) => report,
            Err(e) => {
                let results = targets
                    .into_iter()
                    .map(|transport_id| TransportResult {
                        transport_id,
                        outcome: SendOutcome::Failed {
                            reason: format!("aggregation aborted: {}", e),
                        },
                    })
                    .collect();
                BroadcastReport::new(content_hash, results)
            }
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &SendOutcome) {
        let counter = match outcome {
            SendOutcome::Delivered => &self.delivered,
            SendOutcome::Failed { .. } => &self.failed,
            SendOutcome::TimedOut => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-transport send statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Transport identifier
    pub transport_id: TransportId,
    /// Medium kind
    pub kind: TransportKind,
    /// Whether the transport is started
    pub running: bool,
    /// Delivered sends
    pub delivered: u64,
    /// Failed sends
    pub failed: u64,
    /// Timed-out sends
    pub timed_out: u64,
}

struct Registered {
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
}

/// Registry of active transports and the broadcast entry point.
pub struct FanoutCoordinator {
    transports: RwLock<BTreeMap<TransportId, Registered>>,
    send_timeout: Duration,
}

impl FanoutCoordinator {
    /// Create a coordinator bounding each send by `send_timeout`.
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            transports: RwLock::new(BTreeMap::new()),
            send_timeout,
        }
    }

    fn poisoned() -> MeshError {
        MeshError::InvalidState("transport registry lock poisoned".to_string())
    }

    /// Add a transport to the broadcast set.
    pub fn register(&self, transport: Arc<dyn Transport>) -> MeshResult<()> {
        let mut transports = self.transports.write().map_err(|_| Self::poisoned())?;
        let id = transport.id().to_string();
        if transports.contains_key(&id) {
            return Err(TransportError::DuplicateId(id).into());
        }
        debug!(transport = %id, kind = %transport.kind(), "transport registered");
        transports.insert(
            id,
            Registered {
                transport,
                counters: Arc::new(Counters::default()),
            },
        );
        Ok(())
    }

    /// Remove a transport; sends already dispatched to it still complete.
    pub fn unregister(&self, id: &str) -> MeshResult<Option<Arc<dyn Transport>>> {
        let mut transports = self.transports.write().map_err(|_| Self::poisoned())?;
        let removed = transports.remove(id).map(|r| r.transport);
        if removed.is_some() {
            debug!(transport = %id, "transport unregistered");
        }
        Ok(removed)
    }

    /// Registered transport ids.
    pub fn transport_ids(&self) -> Vec<TransportId> {
        self.transports
            .read()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Registered transports.
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        self.transports
            .read()
            .map(|t| t.values().map(|r| Arc::clone(&r.transport)).collect())
            .unwrap_or_default()
    }

    /// Send statistics for every registered transport.
    pub fn stats(&self) -> Vec<TransportStats> {
        self.transports
            .read()
            .map(|t| {
                t.iter()
                    .map(|(id, r)| TransportStats {
                        transport_id: id.clone(),
                        kind: r.transport.kind(),
                        running: r.transport.is_running(),
                        delivered: r.counters.delivered.load(Ordering::Relaxed),
                        failed: r.counters.failed.load(Ordering::Relaxed),
                        timed_out: r.counters.timed_out.load(Ordering::Relaxed),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Dispatch `packet` to every registered transport except `excluding`.
    ///
    /// Returns as soon as the sends are spawned. Must be called from within
    /// a tokio runtime.
    pub fn broadcast(&self, packet: &SosPacket, excluding: Option<&str>) -> MeshResult<BroadcastTicket> {
        let payload: Arc<[u8]> = packet.to_wire()?.into();
        let targets: Vec<(TransportId, Arc<dyn Transport>, Arc<Counters>)> = {
            let transports = self.transports.read().map_err(|_| Self::poisoned())?;
            transports
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != excluding)
                .map(|(id, r)| (id.clone(), Arc::clone(&r.transport), Arc::clone(&r.counters)))
                .collect()
        };

        debug!(
            packet = %packet,
            targets = targets.len(),
            excluded = excluding.unwrap_or("-"),
            "broadcasting"
        );

        let timeout = self.send_timeout;
        let target_ids: Vec<TransportId> = targets.iter().map(|(id, _, _)| id.clone()).collect();
        let sends: Vec<(TransportId, JoinHandle<SendOutcome>)> = targets
            .into_iter()
            .map(|(id, transport, counters)| {
                let payload = Arc::clone(&payload);
                let task_id = id.clone();
                let handle = tokio::spawn(async move {
                    let outcome = match tokio::time::timeout(timeout, transport.send(&payload)).await {
                        Ok(Ok(())) => SendOutcome::Delivered,
                        Ok(Err(e)) => {
                            warn!(transport = %task_id, "send failed: {}", e);
                            SendOutcome::Failed {
                                reason: e.to_string(),
                            }
                        }
                        Err(_) => {
                            warn!(transport = %task_id, timeout_ms = timeout.as_millis() as u64, "send timed out");
                            SendOutcome::TimedOut
                        }
                    };
                    counters.record(&outcome);
                    outcome
                });
                (id, handle)
            })
            .collect();

        let content_hash = packet.content_hash;
        let aggregate = tokio::spawn(async move {
            let mut results = Vec::with_capacity(sends.len());
            for (transport_id, handle) in sends {
                let outcome = handle.await.unwrap_or_else(|e| SendOutcome::Failed {
                    reason: format!("send task panicked: {}", e),
                });
                results.push(TransportResult {
                    transport_id,
                    outcome,
                });
            }
            BroadcastReport::new(content_hash, results)
        });

        Ok(BroadcastTicket {
            content_hash,
            targets: target_ids,
            aggregate,
        })
    }
}

impl std::fmt::Debug for FanoutCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutCoordinator")
            .field("transports", &self.transport_ids())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{SosRequest, Urgency};
    use crate::transports::{MemoryMedium, MemoryTransport};
    use tokio::sync::mpsc;

    async fn started(id: &str, medium: &MemoryMedium) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport::new(id, medium));
        let (tx, _rx) = mpsc::channel(16);
        transport.start(tx).await.unwrap();
        transport
    }

    fn packet() -> SosPacket {
        SosPacket::originate("N1", SosRequest::new("flood warning", Urgency::High), 1_700_000_000_000)
            .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_but_excluded() {
        let medium = MemoryMedium::new();
        let coordinator = FanoutCoordinator::new(Duration::from_secs(1));
        let a = started("a", &medium).await;
        let b = started("b", &medium).await;
        let c = started("c", &medium).await;
        coordinator.register(a.clone()).unwrap();
        coordinator.register(b.clone()).unwrap();
        coordinator.register(c.clone()).unwrap();

        let ticket = coordinator.broadcast(&packet(), Some("b")).unwrap();
        assert_eq!(ticket.targets(), &["a".to_string(), "c".to_string()]);
        let report = ticket.report().await;

        assert!(report.all_delivered());
        assert_eq!(report.total(), 2);
        assert_eq!(a.sent_count(), 1);
        assert_eq!(b.sent_count(), 0);
        assert_eq!(c.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let medium = MemoryMedium::new();
        let coordinator = FanoutCoordinator::new(Duration::from_secs(1));
        let good = started("good", &medium).await;
        let bad = started("bad", &medium).await;
        bad.set_failing(true);
        coordinator.register(good.clone()).unwrap();
        coordinator.register(bad.clone()).unwrap();

        let report = coordinator.broadcast(&packet(), None).unwrap().report().await;
        assert_eq!(report.delivered_count, 1);
        assert_eq!(report.failure_count, 1);
        assert_eq!(good.sent_count(), 1);

        let stats = coordinator.stats();
        let bad_stats = stats.iter().find(|s| s.transport_id == "bad").unwrap();
        assert_eq!(bad_stats.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_times_out_without_blocking_others() {
        let medium = MemoryMedium::new();
        let coordinator = FanoutCoordinator::new(Duration::from_millis(500));
        let fast = started("fast", &medium).await;
        let slow = started("slow", &medium).await;
        slow.set_send_delay(Duration::from_secs(30));
        coordinator.register(fast.clone()).unwrap();
        coordinator.register(slow.clone()).unwrap();

        let report = coordinator.broadcast(&packet(), None).unwrap().report().await;
        assert_eq!(report.delivered_count, 1);
        assert_eq!(report.timeout_count, 1);
        let slow_result = report.results.iter().find(|r| r.transport_id == "slow").unwrap();
        assert_eq!(slow_result.outcome, SendOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_duplicate_registration_and_unregister() {
        let medium = MemoryMedium::new();
        let coordinator = FanoutCoordinator::new(Duration::from_secs(1));
        let a = started("a", &medium).await;
        coordinator.register(a.clone()).unwrap();
        assert!(matches!(
            coordinator.register(a.clone()),
            Err(MeshError::Transport(TransportError::DuplicateId(_)))
        ));

        assert!(coordinator.unregister("a").unwrap().is_some());
        let report = coordinator.broadcast(&packet(), None).unwrap().report().await;
        assert_eq!(report.total(), 0);
        assert_eq!(a.sent_count(), 0);
    }
}
