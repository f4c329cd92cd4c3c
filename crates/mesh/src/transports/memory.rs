//! In-process broadcast medium
//!
//! Every transport attached to a [`MemoryMedium`] hears every other
//! transport on it, never itself. Separate media model separate radio
//! neighbourhoods, so a chain A - B - C is two media with B on both.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

use crate::transport::{
    InboundFrame, InboundSender, Transport, TransportError, TransportId, TransportKind,
};

/// Shared broadcast domain.
#[derive(Debug, Clone, Default)]
pub struct MemoryMedium {
    listeners: Arc<Mutex<HashMap<TransportId, InboundSender>>>,
}

impl MemoryMedium {
    /// Create an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of started transports on the medium.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    fn attach(&self, id: &str, inbound: InboundSender) -> Result<(), TransportError> {
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| TransportError::Link("memory medium poisoned".to_string()))?;
        listeners.insert(id.to_string(), inbound);
        Ok(())
    }

    fn detach(&self, id: &str) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(id);
        }
    }

    fn peers_of(&self, id: &str) -> Result<Vec<(TransportId, InboundSender)>, TransportError> {
        let listeners = self
            .listeners
            .lock()
            .map_err(|_| TransportError::Link("memory medium poisoned".to_string()))?;
        Ok(listeners
            .iter()
            .filter(|(peer, _)| peer.as_str() != id)
            .map(|(peer, tx)| (peer.clone(), tx.clone()))
            .collect())
    }
}

/// Transport on a [`MemoryMedium`], with fault injection for tests.
#[derive(Debug)]
pub struct MemoryTransport {
    id: TransportId,
    kind: TransportKind,
    medium: MemoryMedium,
    running: AtomicBool,
    failing: AtomicBool,
    send_delay_ms: AtomicU64,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTransport {
    /// Create a transport with the given id on `medium`.
    pub fn new(id: impl Into<TransportId>, medium: &MemoryMedium) -> Self {
        Self::with_kind(id, medium, TransportKind::Memory)
    }

    /// Create a transport reporting a different medium kind, for simulating
    /// a heterogeneous node.
    pub fn with_kind(id: impl Into<TransportId>, medium: &MemoryMedium, kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            kind,
            medium: medium.clone(),
            running: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            send_delay_ms: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Make every following send fail with a link error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every following send.
    pub fn set_send_delay(&self, delay: Duration) {
        self.send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Payloads successfully handed to the medium, oldest first.
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of successful sends.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, inbound: InboundSender) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRunning(self.id.clone()));
        }
        self.medium.attach(&self.id, inbound)?;
        debug!(transport = %self.id, "memory transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(TransportError::NotRunning(self.id.clone()));
        }
        self.medium.detach(&self.id);
        debug!(transport = %self.id, "memory transport stopped");
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning(self.id.clone()));
        }
        let delay = self.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Link(format!("{} injected failure", self.id)));
        }

        for (peer, tx) in self.medium.peers_of(&self.id)? {
            let frame = InboundFrame {
                bytes: payload.to_vec(),
                source: peer.clone(),
            };
            // A peer that has shut down its inbound loop is simply out of range.
            if tx.send(frame).await.is_err() {
                trace!(from = %self.id, to = %peer, "peer inbound closed");
            }
        }

        if let Ok(mut sent) = self.sent.lock() {
            sent.push(payload.to_vec());
        }
        Ok(())
    }
}
