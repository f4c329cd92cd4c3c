//! Test utilities for multi-node mesh scenarios

use async_trait::async_trait;
use sonicwave_core::Config;
use sonicwave_mesh::transports::{MemoryMedium, MemoryTransport};
use sonicwave_mesh::{Backend, MeshNode, SosPacket, UploadError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// Upper bound for anything the scenarios wait on.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("sonicwave_mesh=debug")
        .try_init();
}

/// Node config with the UDP transport disabled.
pub fn node_config(node_id: &str) -> Config {
    let mut config = Config::for_node(node_id);
    config.udp.enabled = false;
    config
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Let in-flight frames land before asserting that something did not happen.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

/// Backend that records deliveries, or fails every one while `failing`.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    delivered: Mutex<Vec<SosPacket>>,
    failing: AtomicBool,
}

impl RecordingBackend {
    /// Backend that accepts everything.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend that refuses everything.
    pub fn unreachable() -> Arc<Self> {
        let backend = Self::default();
        backend.failing.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    /// Packets accepted so far.
    pub fn delivered(&self) -> Vec<SosPacket> {
        self.delivered.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Number of packets accepted so far.
    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().map(|d| d.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    async fn deliver(&self, packet: &SosPacket) -> Result<(), UploadError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(UploadError::Backend("backend unreachable".to_string()));
        }
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push(packet.clone());
        }
        Ok(())
    }
}

/// Nodes `N0 .. N{n-1}` in a line, each sharing one medium with each
/// neighbour.
pub struct MeshChain {
    pub nodes: Vec<MeshNode>,
    pub links: Vec<Arc<MemoryTransport>>,
}

impl MeshChain {
    /// Build a chain of `len` nodes without backends.
    pub async fn new(len: usize) -> Self {
        Self::with_backends(len, |_| None).await
    }

    /// Build a chain of `len` nodes; `backend(i)` supplies node `i`'s
    /// upload backend.
    pub async fn with_backends<F>(len: usize, backend: F) -> Self
    where
        F: Fn(usize) -> Option<Arc<dyn Backend>>,
    {
        let nodes: Vec<MeshNode> = (0..len)
            .map(|i| MeshNode::new(node_config(&format!("N{}", i)), backend(i)).unwrap())
            .collect();

        let mut links = Vec::new();
        for i in 1..len {
            let medium = MemoryMedium::new();
            for end in [i - 1, i] {
                let link = Arc::new(MemoryTransport::new(
                    format!("N{}:link{}", end, i),
                    &medium,
                ));
                nodes[end].attach_transport(link.clone()).await.unwrap();
                links.push(link);
            }
        }

        Self { nodes, links }
    }

    /// Node `i`.
    pub fn node(&self, i: usize) -> &MeshNode {
        &self.nodes[i]
    }

    /// Stop every node.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await.unwrap();
        }
    }
}
