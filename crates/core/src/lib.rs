//! Core functionality for the SonicWave emergency mesh.
//!
//! This crate provides the configuration model, error types, logging
//! initialisation and time helpers shared by the mesh engine and the node
//! daemon.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::{
    Config, FanoutConfig, LoggingConfig, NodeConfig, RelayConfig, UdpConfig, UploadConfig,
};
pub use error::{ConfigError, CoreError, Result};
pub use types::{unix_millis, Millis};
