//! SOS packet model
//!
//! A packet has an immutable identity (`packet_id`, `content_hash`, sender,
//! message, urgency, location, origination timestamp) and relay metadata
//! (`hop_count`, `ttl_remaining`, `relay_path`). Relay metadata only changes
//! through [`SosPacket::derive_relay_copy`], which returns a new packet.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a node in the mesh
pub type NodeId = String;

/// Identifier of one logical transmission.
pub type PacketId = String;

/// Identifier grouping an initial SOS with its follow-up updates.
pub type ThreadId = String;

const CONTENT_HASH_DOMAIN: &[u8] = b"sonicwave/sos-content/v1";

/// Coordinates are hashed in 1e-7 degree units.
const COORDINATE_SCALE: f64 = 1e7;

/// Altitude and accuracy are hashed in centimetres.
const METRIC_SCALE: f64 = 100.0;

/// Packets that fail structural validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StructuralError {
    /// Bytes are not a JSON packet with every required field
    #[error("Undecodable packet: {0}")]
    Decode(String),

    /// A required identifier is empty
    #[error("Required field is empty: {0}")]
    EmptyField(&'static str),

    /// relay_path and hop_count disagree
    #[error("Relay path length {path_len} does not match hop count {hop_count}")]
    PathLengthMismatch {
        /// Number of relay path entries
        path_len: usize,
        /// Carried hop count
        hop_count: u32,
    },

    /// The same node forwarded the packet twice
    #[error("Node {0} appears more than once in the relay path")]
    DuplicateRelayNode(NodeId),

    /// The originator shows up as a forwarder
    #[error("Originator {0} appears in the relay path")]
    OriginatorInPath(NodeId),

    /// hop_count + ttl_remaining differs from the urgency's hop budget
    #[error("Hop budget mismatch for {urgency}: hop_count {hop_count} + ttl_remaining {ttl_remaining} != {expected}")]
    HopBudgetMismatch {
        /// Urgency of the packet
        urgency: Urgency,
        /// Carried hop count
        hop_count: u32,
        /// Carried remaining budget
        ttl_remaining: u32,
        /// Initial budget for the urgency
        expected: u32,
    },

    /// Carried digest does not match the identity fields
    #[error("Content hash mismatch: carried {carried}, computed {computed}")]
    HashMismatch {
        /// Hash on the wire
        carried: ContentHash,
        /// Hash recomputed from identity fields
        computed: ContentHash,
    },

    /// Content hash is not 64 hex characters
    #[error("Invalid content hash encoding: {0}")]
    InvalidHash(String),

    /// Coordinates out of range or not finite
    #[error("Invalid location: {0}")]
    InvalidLocation(String),

    /// ACK packets must name the content they acknowledge
    #[error("ACK packet does not reference acknowledged content")]
    AckWithoutTarget,
}

/// Errors raised when deriving a relay copy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PacketError {
    /// The hop budget is spent; the packet is terminal
    #[error("TTL exhausted for packet {packet_id}")]
    TtlExhausted {
        /// Packet that can no longer be relayed
        packet_id: PacketId,
    },

    /// The local node already forwarded (or originated) this packet
    #[error("Node {node} already appears on the path of packet {packet_id}")]
    AlreadyRelayed {
        /// Local node
        node: NodeId,
        /// Packet in question
        packet_id: PacketId,
    },
}

/// Urgency of an emergency, ordered `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Urgency {
    /// Information only
    Low,
    /// Non-urgent help needed
    Medium,
    /// Urgent assistance needed
    High,
    /// Life-threatening emergency
    Critical,
}

impl Urgency {
    /// Hop budget assigned at origination.
    pub fn initial_ttl(self) -> u32 {
        match self {
            Urgency::Critical => 20,
            Urgency::High => 15,
            Urgency::Medium => 10,
            Urgency::Low => 5,
        }
    }

    /// Whether the backend should hear about first acceptance right away
    /// instead of with the next batch.
    pub fn notify_immediately(self) -> bool {
        matches!(self, Urgency::Critical | Urgency::High)
    }

    /// Base weight used by [`SosPacket::priority_score`].
    pub fn priority_weight(self) -> u32 {
        match self {
            Urgency::Critical => 1000,
            Urgency::High => 100,
            Urgency::Medium => 10,
            Urgency::Low => 1,
        }
    }

    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Urgency::Critical => "CRITICAL",
            Urgency::High => "HIGH",
            Urgency::Medium => "MEDIUM",
            Urgency::Low => "LOW",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of message carried by a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketType {
    /// Initial emergency report
    #[default]
    Sos,
    /// Location or status update for an existing thread
    StatusUpdate,
    /// Sender reports the emergency resolved
    AllClear,
    /// Liveness beacon
    Heartbeat,
    /// Backend receipt announced by a node that reached it
    Ack,
}

impl PacketType {
    /// Whether packets of this type are reported to the backend. Beacons
    /// and receipts are mesh-internal.
    pub fn is_reportable(self) -> bool {
        !matches!(self, PacketType::Heartbeat | PacketType::Ack)
    }
}

/// Backend acknowledgement state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckState {
    /// No receipt known
    #[default]
    Pending,
    /// Backend (or a node that reached it) confirmed receipt
    Acknowledged,
}

/// Resolved position attached to a packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees (-90 to 90)
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180)
    pub longitude: f64,
    /// Altitude in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Horizontal accuracy in meters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Free-text description ("north stairwell, 3rd floor")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Location {
    /// Create a validated coordinate pair.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, StructuralError> {
        let location = Self {
            latitude,
            longitude,
            altitude: None,
            accuracy: None,
            description: None,
        };
        location.validate()?;
        Ok(location)
    }

    /// Attach an altitude in meters.
    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }

    /// Attach a horizontal accuracy in meters.
    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = Some(accuracy);
        self
    }

    /// Attach a textual description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Range and finiteness checks.
    pub fn validate(&self) -> Result<(), StructuralError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(StructuralError::InvalidLocation(format!(
                "latitude must be between -90 and 90, got {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(StructuralError::InvalidLocation(format!(
                "longitude must be between -180 and 180, got {}",
                self.longitude
            )));
        }
        if let Some(altitude) = self.altitude {
            if !altitude.is_finite() {
                return Err(StructuralError::InvalidLocation(
                    "altitude must be finite".to_string(),
                ));
            }
        }
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(StructuralError::InvalidLocation(format!(
                    "accuracy must be a non-negative distance, got {}",
                    accuracy
                )));
            }
        }
        Ok(())
    }

    fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&fixed_point(self.latitude, COORDINATE_SCALE).to_be_bytes());
        hasher.update(&fixed_point(self.longitude, COORDINATE_SCALE).to_be_bytes());
        hash_optional(hasher, self.altitude.map(|a| fixed_point(a, METRIC_SCALE)));
        hash_optional(hasher, self.accuracy.map(|a| fixed_point(a, METRIC_SCALE)));
        match &self.description {
            Some(text) => {
                hasher.update(&[1]);
                hash_field(hasher, text.as_bytes());
            }
            None => {
                hasher.update(&[0]);
            }
        }
    }
}

/// BLAKE3 digest over a packet's identity fields.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding used on the wire.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the wire encoding.
    pub fn from_hex(encoded: &str) -> Result<Self, StructuralError> {
        let bytes =
            hex::decode(encoded).map_err(|e| StructuralError::InvalidHash(e.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            StructuralError::InvalidHash(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl TryFrom<String> for ContentHash {
    type Error = StructuralError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.to_hex()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

/// Caller-supplied content of a new packet.
#[derive(Debug, Clone)]
pub struct SosRequest {
    /// Human-readable message
    pub message: String,
    /// Urgency; determines the hop budget
    pub urgency: Urgency,
    /// Kind of message
    pub packet_type: PacketType,
    /// Position; the node falls back to its location provider when absent
    pub location: Option<Location>,
    /// Continue an existing thread instead of starting a new one
    pub thread_id: Option<ThreadId>,
    /// Content acknowledged by an ACK packet
    pub acknowledges: Option<ContentHash>,
}

impl SosRequest {
    /// A new SOS with the given message and urgency.
    pub fn new(message: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            message: message.into(),
            urgency,
            packet_type: PacketType::Sos,
            location: None,
            thread_id: None,
            acknowledges: None,
        }
    }

    /// An update continuing `thread_id`.
    pub fn update(thread_id: impl Into<ThreadId>, message: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            packet_type: PacketType::StatusUpdate,
            thread_id: Some(thread_id.into()),
            ..Self::new(message, urgency)
        }
    }

    /// Attach a location.
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Override the packet type.
    pub fn with_type(mut self, packet_type: PacketType) -> Self {
        self.packet_type = packet_type;
        self
    }
}

/// The atomic unit of the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosPacket {
    /// Unique per logical transmission, stable across relays
    pub packet_id: PacketId,
    /// Digest over the identity fields
    pub content_hash: ContentHash,
    /// Originating device (not authenticated)
    pub sender_id: NodeId,
    /// Kind of message
    #[serde(default)]
    pub packet_type: PacketType,
    /// Human-readable message
    pub message: String,
    /// Urgency level
    pub urgency: Urgency,
    /// Resolved position, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Origination time (Unix epoch milliseconds)
    pub origination_timestamp: u64,
    /// Number of re-broadcasts so far
    pub hop_count: u32,
    /// Remaining hop budget
    pub ttl_remaining: u32,
    /// Nodes that forwarded this packet, in order
    pub relay_path: Vec<NodeId>,
    /// Emergency thread this packet belongs to
    pub thread_id: ThreadId,
    /// Backend acknowledgement state
    #[serde(default)]
    pub ack_state: AckState,
    /// Content acknowledged by an ACK packet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledges: Option<ContentHash>,
}

impl SosPacket {
    /// Build a fresh packet at hop 0 with the urgency's full hop budget.
    ///
    /// A new `thread_id` is generated unless the request continues one.
    pub fn originate(
        sender_id: &str,
        request: SosRequest,
        timestamp_ms: u64,
    ) -> Result<Self, StructuralError> {
        if sender_id.is_empty() {
            return Err(StructuralError::EmptyField("sender_id"));
        }
        if let Some(location) = &request.location {
            location.validate()?;
        }
        if request.packet_type == PacketType::Ack && request.acknowledges.is_none() {
            return Err(StructuralError::AckWithoutTarget);
        }
        let thread_id = match request.thread_id {
            Some(thread_id) if thread_id.is_empty() => {
                return Err(StructuralError::EmptyField("thread_id"))
            }
            Some(thread_id) => thread_id,
            None => uuid::Uuid::new_v4().simple().to_string(),
        };

        let content_hash = compute_content_hash(
            sender_id,
            &request.message,
            request.urgency,
            request.location.as_ref(),
            timestamp_ms,
        );

        Ok(Self {
            packet_id: uuid::Uuid::new_v4().simple().to_string(),
            content_hash,
            sender_id: sender_id.to_string(),
            packet_type: request.packet_type,
            message: request.message,
            urgency: request.urgency,
            location: request.location,
            origination_timestamp: timestamp_ms,
            hop_count: 0,
            ttl_remaining: request.urgency.initial_ttl(),
            relay_path: Vec::new(),
            thread_id,
            ack_state: AckState::Pending,
            acknowledges: request.acknowledges,
        })
    }

    /// Recompute the digest from the identity fields.
    pub fn compute_content_hash(&self) -> ContentHash {
        compute_content_hash(
            &self.sender_id,
            &self.message,
            self.urgency,
            self.location.as_ref(),
            self.origination_timestamp,
        )
    }

    /// Copy for re-broadcast by `local_node`: one more hop, one less TTL,
    /// `local_node` appended to the relay path.
    pub fn derive_relay_copy(&self, local_node: &str) -> Result<SosPacket, PacketError> {
        if self.ttl_remaining == 0 {
            return Err(PacketError::TtlExhausted {
                packet_id: self.packet_id.clone(),
            });
        }
        if self.sender_id == local_node || self.relay_path.iter().any(|n| n == local_node) {
            return Err(PacketError::AlreadyRelayed {
                node: local_node.to_string(),
                packet_id: self.packet_id.clone(),
            });
        }

        let mut copy = self.clone();
        copy.hop_count += 1;
        copy.ttl_remaining -= 1;
        copy.relay_path.push(local_node.to_string());
        Ok(copy)
    }

    /// Copy carrying a known backend receipt. Ack state is local metadata
    /// and leaves the content hash unchanged.
    pub fn acknowledged(&self) -> SosPacket {
        let mut copy = self.clone();
        copy.ack_state = AckState::Acknowledged;
        copy
    }

    /// A packet whose hop budget is spent may be uploaded but never relayed.
    pub fn is_terminal(&self) -> bool {
        self.ttl_remaining == 0
    }

    /// Structural well-formedness of a received packet.
    pub fn validate(&self) -> Result<(), StructuralError> {
        if self.packet_id.is_empty() {
            return Err(StructuralError::EmptyField("packet_id"));
        }
        if self.sender_id.is_empty() {
            return Err(StructuralError::EmptyField("sender_id"));
        }
        if self.thread_id.is_empty() {
            return Err(StructuralError::EmptyField("thread_id"));
        }
        if self.relay_path.len() != self.hop_count as usize {
            return Err(StructuralError::PathLengthMismatch {
                path_len: self.relay_path.len(),
                hop_count: self.hop_count,
            });
        }

        let mut seen = HashSet::with_capacity(self.relay_path.len());
        for node in &self.relay_path {
            if node.is_empty() {
                return Err(StructuralError::EmptyField("relay_path"));
            }
            if *node == self.sender_id {
                return Err(StructuralError::OriginatorInPath(node.clone()));
            }
            if !seen.insert(node.as_str()) {
                return Err(StructuralError::DuplicateRelayNode(node.clone()));
            }
        }

        let expected = self.urgency.initial_ttl();
        if self.hop_count.checked_add(self.ttl_remaining) != Some(expected) {
            return Err(StructuralError::HopBudgetMismatch {
                urgency: self.urgency,
                hop_count: self.hop_count,
                ttl_remaining: self.ttl_remaining,
                expected,
            });
        }

        if let Some(location) = &self.location {
            location.validate()?;
        }
        if self.packet_type == PacketType::Ack && self.acknowledges.is_none() {
            return Err(StructuralError::AckWithoutTarget);
        }

        let computed = self.compute_content_hash();
        if computed != self.content_hash {
            return Err(StructuralError::HashMismatch {
                carried: self.content_hash,
                computed,
            });
        }
        Ok(())
    }

    /// Serialize to the JSON wire format.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and validate a packet received from a transport.
    ///
    /// Unknown fields are ignored; missing required fields are structural
    /// errors.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, StructuralError> {
        let packet: SosPacket =
            serde_json::from_slice(bytes).map_err(|e| StructuralError::Decode(e.to_string()))?;
        packet.validate()?;
        Ok(packet)
    }

    /// Processing priority: urgency, then freshness, then whether an SOS is
    /// still waiting for a receipt.
    pub fn priority_score(&self) -> u32 {
        let freshness_bonus = 20u32.saturating_sub(self.hop_count);
        let ack_bonus = if self.packet_type == PacketType::Sos && self.ack_state == AckState::Pending
        {
            50
        } else {
            0
        };
        self.urgency.priority_weight() + freshness_bonus + ack_bonus
    }
}

impl fmt::Display for SosPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short_id: String = self.packet_id.chars().take(8).collect();
        write!(
            f,
            "SosPacket({}, {}, hops:{}, ttl:{})",
            short_id,
            self.urgency,
            self.hop_count,
            self.ttl_remaining
        )
    }
}

/// Digest over (sender, message, location, urgency, origination timestamp).
///
/// The encoding is length-prefixed and fixed-point so that independent
/// implementations agree on it byte for byte.
pub fn compute_content_hash(
    sender_id: &str,
    message: &str,
    urgency: Urgency,
    location: Option<&Location>,
    origination_timestamp: u64,
) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hash_field(&mut hasher, CONTENT_HASH_DOMAIN);
    hash_field(&mut hasher, sender_id.as_bytes());
    hash_field(&mut hasher, message.as_bytes());
    hash_field(&mut hasher, urgency.as_str().as_bytes());
    hasher.update(&origination_timestamp.to_be_bytes());
    match location {
        Some(location) => {
            hasher.update(&[1]);
            location.hash_into(&mut hasher);
        }
        None => {
            hasher.update(&[0]);
        }
    }
    ContentHash(*hasher.finalize().as_bytes())
}

fn hash_field(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn hash_optional(hasher: &mut blake3::Hasher, value: Option<i64>) {
    match value {
        Some(v) => {
            hasher.update(&[1]);
            hasher.update(&v.to_be_bytes());
        }
        None => {
            hasher.update(&[0]);
        }
    }
}

fn fixed_point(value: f64, scale: f64) -> i64 {
    (value * scale).round() as i64
}
