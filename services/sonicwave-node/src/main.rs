use anyhow::{bail, Context};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use sonicwave_core::{logging, Config};
use sonicwave_mesh::transports::LocalBroadcastTransport;
use sonicwave_mesh::{Backend, HttpBackend, MeshNode};

const NODE_PROTOCOL_VERSION: u32 = 1;
const NODE_RUNTIME_VERSION: u32 = 1;
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct NodeVersionHandshake {
    version: &'static str,
    runtime_version: u32,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--version-json") {
        let handshake = NodeVersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            runtime_version: NODE_RUNTIME_VERSION,
            protocol_version: NODE_PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config_path = parse_config_path(&args)?;
    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    logging::init_from_config(&config.logging);

    let backend: Option<Arc<dyn Backend>> = if config.upload.enabled {
        Some(Arc::new(HttpBackend::from_config(&config.upload)?))
    } else {
        None
    };
    let node = MeshNode::new(config.clone(), backend)?;

    if config.udp.enabled {
        let udp = LocalBroadcastTransport::new("udp-multicast", &config.udp)?;
        node.attach_transport(Arc::new(udp)).await?;
    }

    info!(
        node_id = %config.node.node_id,
        config = %config_path.display(),
        upload = config.upload.enabled,
        udp = config.udp.enabled,
        "sonicwave-node running"
    );

    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("signal handler failed: {}", e);
                }
                break;
            }
            _ = stats_tick.tick() => {
                match serde_json::to_string(&node.stats()) {
                    Ok(stats) => info!(stats = %stats, "node stats"),
                    Err(e) => warn!("stats not serializable: {}", e),
                }
            }
        }
    }

    info!("shutting down");
    node.shutdown().await?;
    Ok(())
}

fn parse_config_path(args: &[String]) -> anyhow::Result<PathBuf> {
    let mut args_iter = args.iter();
    while let Some(arg) = args_iter.next() {
        if arg == "--config" {
            if let Some(path) = args_iter.next() {
                return Ok(PathBuf::from(path));
            }
            bail!("--config was provided without a path");
        }
    }

    bail!("missing required --config <path> argument")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_config_path() {
        let path = parse_config_path(&args(&["sonicwave-node", "--config", "/etc/sw.toml"])).unwrap();
        assert_eq!(path, PathBuf::from("/etc/sw.toml"));
    }

    #[test]
    fn test_parse_config_path_missing() {
        assert!(parse_config_path(&args(&["sonicwave-node"])).is_err());
        assert!(parse_config_path(&args(&["sonicwave-node", "--config"])).is_err());
    }
}
