//! Local-network broadcast over UDP multicast
//!
//! One serialized packet per datagram. Packets larger than the configured
//! datagram ceiling are refused instead of being fragmented by IP.

use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use sonicwave_core::UdpConfig;

use crate::transport::{
    InboundFrame, InboundSender, Transport, TransportError, TransportId, TransportKind,
};

struct Running {
    socket: Arc<UdpSocket>,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<()>,
}

/// UDP multicast transport.
pub struct LocalBroadcastTransport {
    id: TransportId,
    group: Ipv4Addr,
    port: u16,
    max_datagram_bytes: usize,
    running: AtomicBool,
    state: Mutex<Option<Running>>,
}

impl LocalBroadcastTransport {
    /// Create a transport from the `[udp]` section.
    pub fn new(id: impl Into<TransportId>, config: &UdpConfig) -> Result<Self, TransportError> {
        let group: Ipv4Addr = config.multicast_group.parse().map_err(|_| {
            TransportError::Link(format!("invalid multicast group {}", config.multicast_group))
        })?;
        Ok(Self {
            id: id.into(),
            group,
            port: config.port,
            max_datagram_bytes: config.max_datagram_bytes,
            running: AtomicBool::new(false),
            state: Mutex::new(None),
        })
    }

    fn destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        let state = self
            .state
            .lock()
            .map_err(|_| TransportError::Link("udp transport state poisoned".to_string()))?;
        state
            .as_ref()
            .map(|r| Arc::clone(&r.socket))
            .ok_or_else(|| TransportError::NotRunning(self.id.clone()))
    }
}

async fn receive_loop(
    id: TransportId,
    socket: Arc<UdpSocket>,
    inbound: InboundSender,
    max_datagram_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; max_datagram_bytes];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(transport = %id, "udp receive loop stopping");
                break;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        let frame = InboundFrame {
                            bytes: buf[..len].to_vec(),
                            source: id.clone(),
                        };
                        debug!(transport = %id, %peer, bytes = len, "datagram received");
                        if inbound.send(frame).await.is_err() {
                            debug!(transport = %id, "inbound queue closed");
                            break;
                        }
                    }
                    Err(e) => warn!(transport = %id, "udp receive failed: {}", e),
                }
            }
        }
    }
}

#[async_trait]
impl Transport for LocalBroadcastTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::LocalBroadcast
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, inbound: InboundSender) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRunning(self.id.clone()));
        }

        let bound = async {
            let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.port)).await?;
            socket.join_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED)?;
            socket.set_multicast_ttl_v4(1)?;
            Ok::<_, std::io::Error>(socket)
        }
        .await;
        let socket = match bound {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let receiver = tokio::spawn(receive_loop(
            self.id.clone(),
            Arc::clone(&socket),
            inbound,
            self.max_datagram_bytes,
            shutdown_rx,
        ));

        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Link("udp transport state poisoned".to_string()))?;
        *state = Some(Running {
            socket,
            shutdown,
            receiver,
        });
        info!(transport = %self.id, group = %self.group, port = self.port, "local broadcast started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let running = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| TransportError::Link("udp transport state poisoned".to_string()))?;
            state.take()
        };
        let Some(running) = running else {
            return Err(TransportError::NotRunning(self.id.clone()));
        };
        self.running.store(false, Ordering::SeqCst);

        let _ = running.shutdown.send(true);
        if let Err(e) = running.receiver.await {
            warn!(transport = %self.id, "udp receive task ended abnormally: {}", e);
        }
        if let Err(e) = running.socket.leave_multicast_v4(self.group, Ipv4Addr::UNSPECIFIED) {
            debug!(transport = %self.id, "leave multicast failed: {}", e);
        }
        info!(transport = %self.id, "local broadcast stopped");
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > self.max_datagram_bytes {
            return Err(TransportError::Oversize {
                size: payload.len(),
                limit: self.max_datagram_bytes,
            });
        }
        let socket = self.socket()?;
        socket.send_to(payload, self.destination()).await?;
        Ok(())
    }
}
