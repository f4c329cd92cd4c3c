//! Mesh node runtime
//!
//! Owns one [`RelayEngine`] and the background tasks around it:
//!
//! - inbound loop: drains every transport's receive queue into the engine
//! - upload bridge: delivers accepted packets to the backend
//! - upload event loop: feeds delivery results back into the engine
//! - maintenance tick: retention pruning, limiter and neighbour housekeeping
//!
//! Every task watches the same shutdown signal.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use sonicwave_core::{unix_millis, Config};

use crate::error::{MeshError, MeshResult};
use crate::fanout::{FanoutCoordinator, TransportStats};
use crate::location::LocationProvider;
use crate::packet::{NodeId, SosRequest, ThreadId};
use crate::relay::{LocalAck, RelayEngine, RelayStats};
use crate::thread::{EmergencyThread, ThreadKey, ThreadSummary};
use crate::topology::NeighborSummary;
use crate::transport::{InboundFrame, Transport};
use crate::upload::{Backend, UploadBridge, UploadEvent, UploadHandle, UploadStats};

const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Node-wide statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStats {
    /// Node identity
    pub node_id: NodeId,
    /// Relay counters
    pub relay: RelayStats,
    /// Per-transport send counters
    pub transports: Vec<TransportStats>,
    /// Upload bridge counters, when uploading
    pub upload: Option<UploadStats>,
    /// Nodes heard directly within the active window
    pub neighbors: Vec<NeighborSummary>,
}

/// A running mesh node.
pub struct MeshNode {
    engine: Arc<RelayEngine>,
    inbound: mpsc::Sender<InboundFrame>,
    upload: Option<UploadHandle>,
    location: Option<Arc<dyn LocationProvider>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Validate `config` and start the node's background tasks. Supplying a
    /// backend enables the upload bridge.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config, backend: Option<Arc<dyn Backend>>) -> MeshResult<Self> {
        config.validate()?;

        let (shutdown, _) = watch::channel(false);
        let fanout = Arc::new(FanoutCoordinator::new(Duration::from_millis(
            config.fanout.send_timeout_ms,
        )));
        let mut tasks = Vec::new();

        let (upload, events) = match backend {
            Some(backend) => {
                let (bridge, handle, events) = UploadBridge::new(&config.upload, backend);
                tasks.push(tokio::spawn(bridge.run(shutdown.subscribe())));
                (Some(handle), Some(events))
            }
            None => (None, None),
        };

        let engine = Arc::new(RelayEngine::new(
            config.node.node_id.clone(),
            &config.relay,
            fanout,
            upload.clone(),
        ));

        let (inbound, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        tasks.push(tokio::spawn(inbound_loop(
            Arc::clone(&engine),
            inbound_rx,
            shutdown.subscribe(),
        )));
        if let Some(events) = events {
            tasks.push(tokio::spawn(upload_event_loop(
                Arc::clone(&engine),
                events,
                shutdown.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(maintenance_loop(
            Arc::clone(&engine),
            Duration::from_secs(config.relay.maintenance_interval_secs.max(1)),
            shutdown.subscribe(),
        )));

        info!(
            node_id = %config.node.node_id,
            uploading = upload.is_some(),
            "mesh node started"
        );

        Ok(Self {
            engine,
            inbound,
            upload,
            location: None,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Fill in the position of originated packets that carry none.
    pub fn with_location_provider(mut self, provider: Arc<dyn LocationProvider>) -> Self {
        self.location = Some(provider);
        self
    }

    /// Node identity.
    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    /// Relay engine.
    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Start `transport` and add it to the broadcast set.
    pub async fn attach_transport(&self, transport: Arc<dyn Transport>) -> MeshResult<()> {
        self.engine.fanout().register(Arc::clone(&transport))?;
        if let Err(e) = transport.start(self.inbound.clone()).await {
            self.engine.fanout().unregister(transport.id())?;
            return Err(e.into());
        }
        info!(transport = %transport.id(), kind = %transport.kind(), "transport attached");
        Ok(())
    }

    /// Remove a transport from the broadcast set and stop it.
    pub async fn detach_transport(&self, id: &str) -> MeshResult<()> {
        let transport = self
            .engine
            .fanout()
            .unregister(id)?
            .ok_or_else(|| MeshError::InvalidState(format!("no transport {}", id)))?;
        transport.stop().await?;
        info!(transport = %id, "transport detached");
        Ok(())
    }

    /// Originate a packet. The acknowledgement confirms local acceptance
    /// only; transport and backend outcomes are not awaited.
    pub fn originate(&self, mut request: SosRequest) -> MeshResult<LocalAck> {
        if request.location.is_none() {
            request.location = self.location.as_ref().and_then(|p| p.current());
        }
        self.engine
            .originate(request, unix_millis())
            .map(|origination| origination.ack)
    }

    /// Snapshot of one of `sender`'s threads.
    pub fn thread(&self, sender_id: &str, thread_id: &str) -> Option<EmergencyThread> {
        self.engine.thread(&ThreadKey {
            sender_id: sender_id.to_string(),
            thread_id: ThreadId::from(thread_id),
        })
    }

    /// Summaries of all tracked threads.
    pub fn threads(&self) -> Vec<ThreadSummary> {
        self.engine.thread_summaries()
    }

    /// Node-wide statistics.
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            node_id: self.node_id().to_string(),
            relay: self.engine.stats(),
            transports: self.engine.fanout().stats(),
            upload: self.upload.as_ref().map(UploadHandle::stats),
            neighbors: self.engine.neighbors(unix_millis()),
        }
    }

    /// Stop every task and transport. In-flight sends and uploads are
    /// abandoned; the dedup index is left consistent.
    pub async fn shutdown(&self) -> MeshResult<()> {
        let _ = self.shutdown.send(true);

        for transport in self.engine.fanout().transports() {
            if let Err(e) = transport.stop().await {
                debug!(transport = %transport.id(), "stop on shutdown: {}", e);
            }
        }

        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => {
                return Err(MeshError::InvalidState("node task list poisoned".to_string()));
            }
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("node task ended abnormally: {}", e);
            }
        }
        info!(node_id = %self.node_id(), "mesh node stopped");
        Ok(())
    }
}

async fn inbound_loop(
    engine: Arc<RelayEngine>,
    mut inbound: mpsc::Receiver<InboundFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                // Rejections are logged by the engine; nothing propagates
                if let Err(e) = engine.handle_inbound(&frame.bytes, &frame.source, unix_millis()) {
                    debug!(transport = %frame.source, "inbound packet rejected: {}", e);
                }
            }
        }
    }
    debug!("inbound loop stopped");
}

async fn upload_event_loop(
    engine: Arc<RelayEngine>,
    mut events: mpsc::UnboundedReceiver<UploadEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                if let Err(e) = engine.on_upload_event(&event, unix_millis()) {
                    error!(content_hash = %event.content_hash().short(), "upload event not applied: {}", e);
                }
            }
        }
    }
    debug!("upload event loop stopped");
}

async fn maintenance_loop(
    engine: Arc<RelayEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(e) = engine.maintain(unix_millis()) {
                    error!("maintenance pass failed: {}", e);
                }
            }
        }
    }
    debug!("maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::StaticLocation;
    use crate::packet::{Location, Urgency};
    use crate::transports::{MemoryMedium, MemoryTransport};

    #[tokio::test]
    async fn test_originate_uses_location_provider() {
        let node = MeshNode::new(Config::for_node("N1"), None)
            .unwrap()
            .with_location_provider(Arc::new(StaticLocation::new(Location::new(51.5, -0.12).unwrap())));
        let ack = node.originate(SosRequest::new("injured", Urgency::High)).unwrap();

        let thread = node.thread("N1", &ack.thread_id).unwrap();
        assert_eq!(thread.current_location().unwrap().latitude, 51.5);
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_detach_and_duplicate_ids() {
        let node = MeshNode::new(Config::for_node("N1"), None).unwrap();
        let medium = MemoryMedium::new();
        let transport = Arc::new(MemoryTransport::new("mem", &medium));

        node.attach_transport(transport.clone()).await.unwrap();
        assert!(transport.is_running());
        assert!(node.attach_transport(transport.clone()).await.is_err());

        let ack = node.originate(SosRequest::new("help", Urgency::Critical)).unwrap();
        assert_eq!(ack.targets, vec!["mem".to_string()]);

        node.detach_transport("mem").await.unwrap();
        assert!(!transport.is_running());
        assert!(node.detach_transport("mem").await.is_err());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::for_node("N1");
        config.relay.dedup_capacity = 0;
        assert!(matches!(MeshNode::new(config, None), Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_transports() {
        let node = MeshNode::new(Config::for_node("N1"), None).unwrap();
        let transport = Arc::new(MemoryTransport::new("mem", &MemoryMedium::new()));
        node.attach_transport(transport.clone()).await.unwrap();
        node.shutdown().await.unwrap();
        assert!(!transport.is_running());
        assert_eq!(node.stats().relay.originated, 0);
    }
}
