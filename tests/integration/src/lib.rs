//! Multi-node scenarios for the SonicWave mesh
//!
//! Nodes run in-process and talk over in-memory media, so these suites
//! exercise the full path: origination, fan-out, inbound handling, dedup,
//! relay, upload and ACK propagation.

pub mod test_utils;

#[cfg(test)]
mod flood_scenarios;

#[cfg(test)]
mod upload_scenarios;
