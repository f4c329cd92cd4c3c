//! Concrete transports
//!
//! - [`LocalBroadcastTransport`]: UDP multicast on the local network
//! - [`FramedTransport`]: small-MTU media (short-range radio, acoustic) behind a [`FrameLink`]
//! - [`MemoryTransport`]: in-process medium for simulation and tests

pub mod framed;
pub mod memory;
pub mod udp;

pub use framed::{
    FrameLink, FramedTransport, LinkFrame, Reassembler, ReassemblyLimits, ACOUSTIC_MTU,
    MAX_REASSEMBLED_PAYLOAD, SHORT_RANGE_RADIO_MTU,
};
pub use memory::{MemoryMedium, MemoryTransport};
pub use udp::LocalBroadcastTransport;
