//! SonicWave Mesh - emergency packet relay over whatever medium is available
//!
//! Propagates SOS packets across an ad-hoc mesh of devices by bounded
//! flooding, and surfaces them to a coordinating backend when any node in
//! the mesh can reach it.
//!
//! # Core Components
//!
//! - **Packet model**: hop budget by urgency, deterministic content hash
//! - **Dedup index**: first-accepted-wins per content hash, bounded, upload-aware eviction
//! - **Relay engine**: accept / merge / forward decision for every packet
//! - **Neighbour table**: directly heard nodes, their transports and reliability
//! - **Fan-out coordinator**: concurrent, isolated sends across transports
//! - **Upload bridge**: retrying backend delivery, decoupled from relay timing
//! - **Transports**: UDP multicast, framed short-range radio and acoustic links, in-memory medium
//!
//! # Design Principles
//!
//! 1. **Bounded flood**: each node relays a given content at most once
//! 2. **Fail closed**: if the dedup index cannot answer, nothing is relayed
//! 3. **Backend optional**: the mesh works with zero backend connectivity
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sonicwave_core::Config;
//! use sonicwave_mesh::{MeshNode, SosRequest, Urgency};
//! use sonicwave_mesh::transports::LocalBroadcastTransport;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::for_node("node-1");
//! let node = MeshNode::new(config.clone(), None)?;
//! node.attach_transport(Arc::new(LocalBroadcastTransport::new("udp", &config.udp)?))
//!     .await?;
//!
//! let ack = node.originate(SosRequest::new("flood warning", Urgency::High))?;
//! println!("accepted {} with {} hops", ack.packet_id, ack.ttl_remaining);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod dedup;
pub mod error;
pub mod fanout;
pub mod flood;
pub mod location;
pub mod node;
pub mod packet;
pub mod relay;
pub mod thread;
pub mod topology;
pub mod transport;
pub mod transports;
pub mod upload;

// Re-export main types
pub use dedup::{DedupEntry, DedupError, DedupIndex, Observation, ObserveOutcome};
pub use error::{MeshError, MeshResult};
pub use fanout::{BroadcastReport, BroadcastTicket, FanoutCoordinator, SendOutcome, TransportStats};
pub use flood::FloodLimiter;
pub use location::{CachedLocation, LocationProvider, StaticLocation};
pub use node::{MeshNode, NodeStats};
pub use packet::{
    compute_content_hash, AckState, ContentHash, Location, NodeId, PacketError, PacketId,
    PacketType, SosPacket, SosRequest, StructuralError, ThreadId, Urgency,
};
pub use relay::{Disposition, LocalAck, Origination, RelayEngine, RelayReport, RelayStats};
pub use thread::{EmergencyThread, ThreadKey, ThreadRegistry, ThreadSummary, ThreadUpdate};
pub use topology::{NeighborSummary, NeighborTable};
pub use transport::{InboundFrame, InboundSender, Transport, TransportError, TransportId, TransportKind};
pub use upload::{Backend, HttpBackend, UploadBridge, UploadError, UploadEvent, UploadHandle, UploadHint};
