//! Error types for SonicWave mesh operations.
//!
//! Transport and upload failures are contained at their own boundary; only
//! the ones that reach a caller of the node API are lifted into
//! [`MeshError`].

use thiserror::Error;

use crate::dedup::DedupError;
use crate::packet::{PacketError, StructuralError};
use crate::transport::TransportError;
use crate::upload::UploadError;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Malformed packet; dropped, never propagated
    #[error("Structural error: {0}")]
    Structural(#[from] StructuralError),

    /// Relay copy could not be derived
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Dedup index could not answer; the relay engine fails closed
    #[error("Dedup index error: {0}")]
    Dedup(#[from] DedupError),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Upload bridge failure
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network I/O errors
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] sonicwave_core::ConfigError),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
