//! Transport abstraction
//!
//! A transport is one physical medium the node can speak on. Every concrete
//! medium exposes the same capability set: start, stop, send a serialized
//! packet, and push whatever it receives onto the node's inbound queue
//! tagged with its own id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identifier of a transport instance, unique within a node.
pub type TransportId = String;

/// Medium a transport runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Short-range radio link (BLE-class)
    ShortRangeRadio,
    /// UDP multicast on the local network
    LocalBroadcast,
    /// Acoustic modem
    Acoustic,
    /// In-process medium for simulation
    Memory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::ShortRangeRadio => "short_range_radio",
            TransportKind::LocalBroadcast => "local_broadcast",
            TransportKind::Acoustic => "acoustic",
            TransportKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Transport-level failures. Always isolated to the transport that raised
/// them.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Send or stop on a transport that is not started
    #[error("Transport {0} is not running")]
    NotRunning(TransportId),

    /// Start on a transport that is already running
    #[error("Transport {0} is already running")]
    AlreadyRunning(TransportId),

    /// Another transport with this id is registered
    #[error("Transport {0} is already registered")]
    DuplicateId(TransportId),

    /// Payload does not fit the medium
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    Oversize {
        /// Payload size
        size: usize,
        /// Medium limit
        limit: usize,
    },

    /// Underlying link reported a failure
    #[error("Link failure: {0}")]
    Link(String),

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bytes received by a transport.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Serialized packet
    pub bytes: Vec<u8>,
    /// Transport that received it
    pub source: TransportId,
}

/// Queue every transport delivers received packets into.
pub type InboundSender = mpsc::Sender<InboundFrame>;

/// Capability interface over one communication medium.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier, used for the no-echo rule.
    fn id(&self) -> &str;

    /// Medium kind.
    fn kind(&self) -> TransportKind;

    /// Whether the transport is started.
    fn is_running(&self) -> bool;

    /// Start receiving; received packets are pushed into `inbound`.
    async fn start(&self, inbound: InboundSender) -> Result<(), TransportError>;

    /// Stop receiving and release the medium.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Send one serialized packet.
    async fn send(&self, payload: &[u8]) -> Result<(), TransportError>;
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("running", &self.is_running())
            .finish()
    }
}
