//! Framed transports for small-MTU media
//!
//! Short-range radio characteristics and acoustic modems carry a few hundred
//! bytes at most, so a serialized packet is split into frames:
//!
//! ```text
//! +-------+------------+-----------+-----------+-----------------+
//! | magic | message id | index     | total     | chunk           |
//! | u8    | u32 BE     | u16 BE    | u16 BE    | <= mtu - 9      |
//! +-------+------------+-----------+-----------+-----------------+
//! ```
//!
//! Receivers reassemble per `(peer, message id)`; sets that do not complete
//! within the reassembly timeout are discarded. Oversized sets are refused
//! and the number of incomplete sets per peer and overall is capped.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::transport::{
    InboundFrame, InboundSender, Transport, TransportError, TransportId, TransportKind,
};

/// Default MTU of a short-range radio link.
pub const SHORT_RANGE_RADIO_MTU: usize = 180;

/// Default MTU of an acoustic modem.
pub const ACOUSTIC_MTU: usize = 140;

const FRAME_MAGIC: u8 = 0x5E;
const HEADER_LEN: usize = 9;
const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest payload a frame set may carry.
pub const MAX_REASSEMBLED_PAYLOAD: usize = 64 * 1024;

/// Raw frame received from a link.
#[derive(Debug, Clone)]
pub struct LinkFrame {
    /// Link-level peer address
    pub peer: String,
    /// Frame bytes including the header
    pub bytes: Vec<u8>,
}

/// Physical small-MTU link.
#[async_trait]
pub trait FrameLink: Send + Sync {
    /// Largest frame the link carries.
    fn mtu(&self) -> usize;

    /// Open the link; received frames are pushed into `frames`.
    async fn open(&self, frames: mpsc::Sender<LinkFrame>) -> Result<(), TransportError>;

    /// Close the link.
    async fn close(&self) -> Result<(), TransportError>;

    /// Transmit one frame.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Split `payload` into frames of at most `mtu` bytes.
pub fn encode_frames(message_id: u32, payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>, TransportError> {
    if mtu <= HEADER_LEN {
        return Err(TransportError::Link(format!("mtu {} too small for frame header", mtu)));
    }
    let chunk_len = mtu - HEADER_LEN;
    let total = payload.len().div_ceil(chunk_len).max(1);
    if total > u16::MAX as usize {
        return Err(TransportError::Oversize {
            size: payload.len(),
            limit: chunk_len * u16::MAX as usize,
        });
    }

    let mut frames = Vec::with_capacity(total);
    let mut chunks = payload.chunks(chunk_len);
    for index in 0..total {
        let chunk = chunks.next().unwrap_or(&[]);
        let mut frame = Vec::with_capacity(HEADER_LEN + chunk.len());
        frame.push(FRAME_MAGIC);
        frame.extend_from_slice(&message_id.to_be_bytes());
        frame.extend_from_slice(&(index as u16).to_be_bytes());
        frame.extend_from_slice(&(total as u16).to_be_bytes());
        frame.extend_from_slice(chunk);
        frames.push(frame);
    }
    Ok(frames)
}

struct FrameHeader {
    message_id: u32,
    index: u16,
    total: u16,
}

fn parse_header(frame: &[u8]) -> Option<FrameHeader> {
    if frame.len() < HEADER_LEN || frame[0] != FRAME_MAGIC {
        return None;
    }
    let message_id = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let index = u16::from_be_bytes([frame[5], frame[6]]);
    let total = u16::from_be_bytes([frame[7], frame[8]]);
    if total == 0 || index >= total {
        return None;
    }
    Some(FrameHeader {
        message_id,
        index,
        total,
    })
}

/// Bounds on what one [`Reassembler`] buffers for incomplete sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Largest payload a frame set may reassemble to, in bytes
    pub max_payload: usize,
    /// Most frames a set may announce
    pub max_frames: u16,
    /// Incomplete sets held per peer; the oldest is dropped first
    pub max_sets_per_peer: usize,
    /// Incomplete sets held across all peers; the oldest is dropped first
    pub max_sets: usize,
}

impl ReassemblyLimits {
    /// Limits for a link with the given MTU: a set may not announce more
    /// frames than [`MAX_REASSEMBLED_PAYLOAD`] needs at that MTU.
    pub fn for_mtu(mtu: usize) -> Self {
        let chunk_len = mtu.saturating_sub(HEADER_LEN).max(1);
        let frames = MAX_REASSEMBLED_PAYLOAD.div_ceil(chunk_len);
        Self {
            max_frames: u16::try_from(frames).unwrap_or(u16::MAX),
            ..Self::default()
        }
    }
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            max_payload: MAX_REASSEMBLED_PAYLOAD,
            max_frames: u16::MAX,
            max_sets_per_peer: 4,
            max_sets: 64,
        }
    }
}

struct Partial {
    total: u16,
    chunks: BTreeMap<u16, Vec<u8>>,
    bytes: usize,
    started: Instant,
}

impl Partial {
    fn new(total: u16, now: Instant) -> Self {
        Self {
            total,
            chunks: BTreeMap::new(),
            bytes: 0,
            started: now,
        }
    }
}

/// Reassembly buffer keyed by `(peer, message id)`.
///
/// Memory is proportional to the frames actually received and bounded by
/// [`ReassemblyLimits`].
pub struct Reassembler {
    partials: HashMap<(String, u32), Partial>,
    timeout: Duration,
    limits: ReassemblyLimits,
    rejected: u64,
}

impl Reassembler {
    /// Create a buffer discarding sets older than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self::with_limits(timeout, ReassemblyLimits::default())
    }

    /// Create a buffer with explicit limits.
    pub fn with_limits(timeout: Duration, limits: ReassemblyLimits) -> Self {
        Self {
            partials: HashMap::new(),
            timeout,
            limits,
            rejected: 0,
        }
    }

    /// Feed one frame; returns the payload once its set is complete.
    pub fn accept(&mut self, peer: &str, frame: &[u8], now: Instant) -> Option<Vec<u8>> {
        let header = parse_header(frame)?;
        let chunk = &frame[HEADER_LEN..];
        if chunk.len() > self.limits.max_payload {
            self.rejected += 1;
            return None;
        }

        if header.total == 1 {
            return Some(chunk.to_vec());
        }
        if header.total > self.limits.max_frames {
            self.rejected += 1;
            debug!(peer, total = header.total, limit = self.limits.max_frames, "frame set too large");
            return None;
        }

        let key = (peer.to_string(), header.message_id);
        match self.partials.get(&key).map(|p| p.total) {
            Some(total) if total == header.total => {}
            // A reused message id with a different frame count starts over
            Some(_) => {
                self.partials.insert(key.clone(), Partial::new(header.total, now));
            }
            None => {
                self.make_room(peer);
                self.partials.insert(key.clone(), Partial::new(header.total, now));
            }
        }
        let partial = self.partials.get_mut(&key)?;

        if !partial.chunks.contains_key(&header.index) {
            partial.bytes += chunk.len();
            partial.chunks.insert(header.index, chunk.to_vec());
        }
        if partial.bytes > self.limits.max_payload {
            self.partials.remove(&key);
            self.rejected += 1;
            debug!(peer, message_id = header.message_id, "frame set exceeds payload limit");
            return None;
        }
        if partial.chunks.len() < partial.total as usize {
            return None;
        }

        let partial = self.partials.remove(&key)?;
        Some(partial.chunks.into_values().flatten().collect())
    }

    fn make_room(&mut self, peer: &str) {
        let from_peer = self.partials.keys().filter(|(p, _)| p == peer).count();
        if from_peer >= self.limits.max_sets_per_peer {
            self.evict_oldest(Some(peer));
        }
        if self.partials.len() >= self.limits.max_sets {
            self.evict_oldest(None);
        }
    }

    fn evict_oldest(&mut self, peer: Option<&str>) {
        let oldest = self
            .partials
            .iter()
            .filter(|((p, _), _)| peer.map_or(true, |peer| p == peer))
            .min_by_key(|(_, partial)| partial.started)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            trace!(peer = %key.0, message_id = key.1, "evicting oldest incomplete frame set");
            self.partials.remove(&key);
        }
    }

    /// Drop incomplete sets older than the timeout.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.partials.len();
        let timeout = self.timeout;
        self.partials
            .retain(|_, p| now.saturating_duration_since(p.started) < timeout);
        before - self.partials.len()
    }

    /// Number of incomplete sets held.
    pub fn pending(&self) -> usize {
        self.partials.len()
    }

    /// Frames and sets refused for exceeding the limits.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<()>,
}

/// Transport over a [`FrameLink`].
pub struct FramedTransport<L: FrameLink> {
    id: TransportId,
    kind: TransportKind,
    link: Arc<L>,
    reassembly_timeout: Duration,
    next_message_id: AtomicU32,
    running: AtomicBool,
    state: Mutex<Option<Running>>,
}

impl<L: FrameLink + 'static> FramedTransport<L> {
    /// Short-range radio transport over `link`.
    pub fn short_range_radio(id: impl Into<TransportId>, link: L) -> Self {
        Self::new(id, TransportKind::ShortRangeRadio, link)
    }

    /// Acoustic transport over `link`.
    pub fn acoustic(id: impl Into<TransportId>, link: L) -> Self {
        Self::new(id, TransportKind::Acoustic, link)
    }

    fn new(id: impl Into<TransportId>, kind: TransportKind, link: L) -> Self {
        Self {
            id: id.into(),
            kind,
            link: Arc::new(link),
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            next_message_id: AtomicU32::new(rand::random()),
            running: AtomicBool::new(false),
            state: Mutex::new(None),
        }
    }

    /// Override how long an incomplete frame set is kept.
    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }
}

async fn reassembly_loop(
    id: TransportId,
    mut frames: mpsc::Receiver<LinkFrame>,
    inbound: InboundSender,
    timeout: Duration,
    limits: ReassemblyLimits,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reassembler = Reassembler::with_limits(timeout, limits);
    let mut sweep = tokio::time::interval(timeout);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sweep.tick() => {
                let dropped = reassembler.prune(Instant::now());
                if dropped > 0 {
                    debug!(transport = %id, dropped, "discarded incomplete frame sets");
                }
            }
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                match reassembler.accept(&frame.peer, &frame.bytes, Instant::now()) {
                    Some(bytes) => {
                        let inbound_frame = InboundFrame { bytes, source: id.clone() };
                        if inbound.send(inbound_frame).await.is_err() {
                            break;
                        }
                    }
                    None => trace!(transport = %id, peer = %frame.peer, "frame buffered"),
                }
            }
        }
    }
    debug!(transport = %id, "reassembly loop stopped");
}

#[async_trait]
impl<L: FrameLink + 'static> Transport for FramedTransport<L> {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn start(&self, inbound: InboundSender) -> Result<(), TransportError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyRunning(self.id.clone()));
        }
        let (frames_tx, frames_rx) = mpsc::channel(256);
        if let Err(e) = self.link.open(frames_tx).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let receiver = tokio::spawn(reassembly_loop(
            self.id.clone(),
            frames_rx,
            inbound,
            self.reassembly_timeout,
            ReassemblyLimits::for_mtu(self.link.mtu()),
            shutdown_rx,
        ));
        let mut state = self
            .state
            .lock()
            .map_err(|_| TransportError::Link("framed transport state poisoned".to_string()))?;
        *state = Some(Running { shutdown, receiver });
        info!(transport = %self.id, kind = %self.kind, mtu = self.link.mtu(), "framed transport started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let running = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| TransportError::Link("framed transport state poisoned".to_string()))?;
            state.take()
        };
        let Some(running) = running else {
            return Err(TransportError::NotRunning(self.id.clone()));
        };
        self.running.store(false, Ordering::SeqCst);

        let _ = running.shutdown.send(true);
        if let Err(e) = running.receiver.await {
            warn!(transport = %self.id, "reassembly task ended abnormally: {}", e);
        }
        self.link.close().await?;
        info!(transport = %self.id, "framed transport stopped");
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning(self.id.clone()));
        }
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let frames = encode_frames(message_id, payload, self.link.mtu())?;
        trace!(transport = %self.id, message_id, frames = frames.len(), "sending framed payload");
        for frame in &frames {
            self.link.send_frame(frame).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two ends of a lossless link.
    struct PipeLink {
        name: String,
        mtu: usize,
        peer_frames: Arc<Mutex<Option<mpsc::Sender<LinkFrame>>>>,
        own_frames: Arc<Mutex<Option<mpsc::Sender<LinkFrame>>>>,
    }

    fn pipe(mtu: usize) -> (PipeLink, PipeLink) {
        let a = Arc::new(Mutex::new(None));
        let b = Arc::new(Mutex::new(None));
        (
            PipeLink {
                name: "a".into(),
                mtu,
                peer_frames: Arc::clone(&b),
                own_frames: Arc::clone(&a),
            },
            PipeLink {
                name: "b".into(),
                mtu,
                peer_frames: a,
                own_frames: b,
            },
        )
    }

    #[async_trait]
    impl FrameLink for PipeLink {
        fn mtu(&self) -> usize {
            self.mtu
        }

        async fn open(&self, frames: mpsc::Sender<LinkFrame>) -> Result<(), TransportError> {
            *self.own_frames.lock().unwrap() = Some(frames);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            *self.own_frames.lock().unwrap() = None;
            Ok(())
        }

        async fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
            let tx = self.peer_frames.lock().unwrap().clone();
            let tx = tx.ok_or_else(|| TransportError::Link("peer closed".into()))?;
            tx.send(LinkFrame {
                peer: self.name.clone(),
                bytes: frame.to_vec(),
            })
            .await
            .map_err(|_| TransportError::Link("peer closed".into()))
        }
    }

    #[test]
    fn test_frames_respect_mtu() {
        let payload = vec![7u8; 1000];
        let frames = encode_frames(1, &payload, ACOUSTIC_MTU).unwrap();
        assert!(frames.iter().all(|f| f.len() <= ACOUSTIC_MTU));
        assert_eq!(frames.len(), 1000usize.div_ceil(ACOUSTIC_MTU - HEADER_LEN));
    }

    #[test]
    fn test_reassembles_out_of_order() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let mut frames = encode_frames(42, &payload, SHORT_RANGE_RADIO_MTU).unwrap();
        frames.reverse();

        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let now = Instant::now();
        let mut output = None;
        for frame in &frames {
            output = reassembler.accept("peer", frame, now).or(output);
        }
        assert_eq!(output.unwrap(), payload);
        assert_eq!(reassembler.pending(), 0);
    }

    #[test]
    fn test_interleaved_peers_kept_apart() {
        let a = encode_frames(1, &[1u8; 400], 100).unwrap();
        let b = encode_frames(1, &[2u8; 400], 100).unwrap();
        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let now = Instant::now();
        let mut done = Vec::new();
        for (fa, fb) in a.iter().zip(b.iter()) {
            done.extend(reassembler.accept("a", fa, now));
            done.extend(reassembler.accept("b", fb, now));
        }
        assert_eq!(done, vec![vec![1u8; 400], vec![2u8; 400]]);
    }

    #[test]
    fn test_incomplete_set_pruned_and_garbage_ignored() {
        let frames = encode_frames(9, &[0u8; 500], 100).unwrap();
        let mut reassembler = Reassembler::new(Duration::from_secs(1));
        let start = Instant::now();
        assert!(reassembler.accept("p", &frames[0], start).is_none());
        assert!(reassembler.accept("p", b"junk", start).is_none());
        assert_eq!(reassembler.pending(), 1);
        assert_eq!(reassembler.prune(start + Duration::from_secs(2)), 1);
        assert_eq!(reassembler.pending(), 0);
    }

    fn frame(message_id: u32, index: u16, total: u16, chunk: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_MAGIC];
        frame.extend_from_slice(&message_id.to_be_bytes());
        frame.extend_from_slice(&index.to_be_bytes());
        frame.extend_from_slice(&total.to_be_bytes());
        frame.extend_from_slice(chunk);
        frame
    }

    #[test]
    fn test_oversized_frame_count_refused() {
        let limits = ReassemblyLimits::for_mtu(SHORT_RANGE_RADIO_MTU);
        assert_eq!(
            limits.max_frames as usize,
            MAX_REASSEMBLED_PAYLOAD.div_ceil(SHORT_RANGE_RADIO_MTU - HEADER_LEN)
        );
        let mut reassembler = Reassembler::with_limits(Duration::from_secs(5), limits);
        let now = Instant::now();

        for message_id in 0..100 {
            assert!(reassembler.accept("p", &frame(message_id, 0, u16::MAX, b"x"), now).is_none());
        }
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(reassembler.rejected(), 100);
    }

    #[test]
    fn test_buffered_bytes_capped_per_set() {
        let limits = ReassemblyLimits {
            max_payload: 1_000,
            ..ReassemblyLimits::default()
        };
        let mut reassembler = Reassembler::with_limits(Duration::from_secs(5), limits);
        let now = Instant::now();
        let chunk = [0u8; 400];
        assert!(reassembler.accept("p", &frame(1, 0, 10, &chunk), now).is_none());
        assert!(reassembler.accept("p", &frame(1, 1, 10, &chunk), now).is_none());
        assert_eq!(reassembler.pending(), 1);
        assert!(reassembler.accept("p", &frame(1, 2, 10, &chunk), now).is_none());
        assert_eq!(reassembler.pending(), 0);
        assert_eq!(reassembler.rejected(), 1);
    }

    #[test]
    fn test_incomplete_sets_capped_oldest_dropped() {
        let limits = ReassemblyLimits {
            max_sets_per_peer: 2,
            max_sets: 3,
            ..ReassemblyLimits::default()
        };
        let mut reassembler = Reassembler::with_limits(Duration::from_secs(60), limits);
        let start = Instant::now();

        // One peer opening many sets only displaces its own oldest
        for message_id in 0..50u32 {
            let at = start + Duration::from_millis(message_id as u64);
            reassembler.accept("noisy", &frame(message_id, 0, 2, b"a"), at);
        }
        assert_eq!(reassembler.pending(), 2);
        let late = start + Duration::from_millis(100);
        assert_eq!(reassembler.accept("noisy", &frame(49, 1, 2, b"b"), late).unwrap(), b"ab");
        assert!(reassembler.accept("noisy", &frame(0, 1, 2, b"b"), late).is_none());

        // The overall cap evicts the oldest set of any peer
        reassembler.accept("p1", &frame(7, 0, 2, b"1"), late);
        reassembler.accept("p2", &frame(7, 0, 2, b"2"), late);
        assert_eq!(reassembler.pending(), 3);
        reassembler.accept("p3", &frame(7, 0, 2, b"3"), late);
        assert_eq!(reassembler.pending(), 3);
        assert_eq!(reassembler.accept("p3", &frame(7, 1, 2, b"!"), late).unwrap(), b"3!");
    }

    #[tokio::test]
    async fn test_transport_roundtrip_over_link() {
        let (link_a, link_b) = pipe(SHORT_RANGE_RADIO_MTU);
        let radio_a = FramedTransport::short_range_radio("ble-a", link_a);
        let radio_b = FramedTransport::short_range_radio("ble-b", link_b);
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        radio_a.start(tx_a).await.unwrap();
        radio_b.start(tx_b).await.unwrap();

        let payload = vec![b'x'; 1500];
        radio_a.send(&payload).await.unwrap();

        let frame = rx_b.recv().await.unwrap();
        assert_eq!(frame.source, "ble-b");
        assert_eq!(frame.bytes, payload);

        radio_a.stop().await.unwrap();
        radio_b.stop().await.unwrap();
        assert_eq!(radio_b.kind(), TransportKind::ShortRangeRadio);
    }
}
