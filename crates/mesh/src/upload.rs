//! Upload bridge
//!
//! Best-effort delivery of accepted packets to the coordinating backend,
//! decoupled from mesh relay timing. The relay engine talks to the bridge
//! through an [`UploadHandle`]; the bridge reports back through
//! [`UploadEvent`]s so the engine can release the dedup pins it holds for
//! pending uploads.
//!
//! Delivery policy:
//! - CRITICAL/HIGH packets are attempted immediately, MEDIUM/LOW wait for
//!   the next batch flush
//! - failures back off exponentially with jitter, up to `max_attempts`
//! - items whose thread has been silent for `max_age` are dropped
//! - when more items are due than may be in flight, the highest
//!   `priority_score` goes first

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use sonicwave_core::UploadConfig;

use crate::packet::{ContentHash, SosPacket, Urgency};
use crate::thread::ThreadKey;

/// Upload failures. Retried by the bridge until its caps are reached.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The submission queue is full
    #[error("Upload queue full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// The bridge has shut down
    #[error("Upload bridge closed")]
    Closed,

    /// Backend answered with a non-success status
    #[error("Backend rejected packet with status {0}")]
    Rejected(u16),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Attempt exceeded the request timeout
    #[error("Upload attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Backend configured without any endpoint
    #[error("No backend endpoint configured")]
    NoEndpoint,

    /// Other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Coordinating backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Deliver one packet; any error is retryable.
    async fn deliver(&self, packet: &SosPacket) -> Result<(), UploadError>;
}

/// Backend reached over HTTP: `POST` of the JSON packet to the primary
/// endpoint, then to each backup in order.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl HttpBackend {
    /// Create a backend posting to `endpoints` in order.
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> Result<Self, UploadError> {
        if endpoints.is_empty() {
            return Err(UploadError::NoEndpoint);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }

    /// Create a backend from the `[upload]` section.
    pub fn from_config(config: &UploadConfig) -> Result<Self, UploadError> {
        let endpoints = config
            .endpoint
            .iter()
            .chain(config.backup_endpoints.iter())
            .cloned()
            .collect();
        Self::new(endpoints, Duration::from_secs(config.request_timeout_secs))
    }

    /// Endpoints in the order they are tried.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn deliver(&self, packet: &SosPacket) -> Result<(), UploadError> {
        let mut last_error = UploadError::NoEndpoint;
        for endpoint in &self.endpoints {
            match self.client.post(endpoint).json(packet).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(endpoint = %endpoint, packet = %packet, "backend accepted packet");
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    warn!(endpoint = %endpoint, %status, "backend rejected packet");
                    last_error = UploadError::Rejected(status.as_u16());
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, "backend unreachable: {}", e);
                    last_error = UploadError::Http(e);
                }
            }
        }
        Err(last_error)
    }
}

/// Delivery urgency hint derived from packet urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadHint {
    /// Attempt as soon as possible
    Immediate,
    /// Wait for the next batch flush
    Batched,
}

impl UploadHint {
    /// CRITICAL and HIGH are immediate; MEDIUM and LOW are batched.
    pub fn for_urgency(urgency: Urgency) -> Self {
        if urgency.notify_immediately() {
            UploadHint::Immediate
        } else {
            UploadHint::Batched
        }
    }
}

/// Feedback from the bridge to the relay engine.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Backend accepted the content
    Delivered {
        /// Delivered content
        content_hash: ContentHash,
        /// Copy that was delivered
        packet: Arc<SosPacket>,
    },
    /// Delivery given up
    Abandoned {
        /// Abandoned content
        content_hash: ContentHash,
        /// Why it was given up
        reason: String,
    },
}

impl UploadEvent {
    /// Content the event refers to.
    pub fn content_hash(&self) -> &ContentHash {
        match self {
            UploadEvent::Delivered { content_hash, .. } => content_hash,
            UploadEvent::Abandoned { content_hash, .. } => content_hash,
        }
    }
}

enum UploadCommand {
    Submit {
        packet: Arc<SosPacket>,
        hint: UploadHint,
    },
    Cancel {
        content_hash: ContentHash,
    },
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
    cancelled: AtomicU64,
    pending: AtomicU64,
}

/// Snapshot of bridge activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    /// Items submitted
    pub submitted: u64,
    /// Items delivered
    pub delivered: u64,
    /// Failed attempts that were rescheduled
    pub retried: u64,
    /// Items given up
    pub abandoned: u64,
    /// Items cancelled by a peer acknowledgement
    pub cancelled: u64,
    /// Items currently queued or in flight
    pub pending: u64,
}

/// Cloneable handle for submitting work to a running bridge.
#[derive(Clone)]
pub struct UploadHandle {
    commands: mpsc::Sender<UploadCommand>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl UploadHandle {
    /// Enqueue `packet` for delivery. Never waits.
    pub fn submit(&self, packet: Arc<SosPacket>, hint: UploadHint) -> Result<(), UploadError> {
        self.send(UploadCommand::Submit { packet, hint })
    }

    /// Drop any pending delivery of `content_hash`.
    pub fn cancel(&self, content_hash: ContentHash) -> Result<(), UploadError> {
        self.send(UploadCommand::Cancel { content_hash })
    }

    fn send(&self, command: UploadCommand) -> Result<(), UploadError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => UploadError::QueueFull {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => UploadError::Closed,
        })
    }

    /// Current bridge statistics.
    pub fn stats(&self) -> UploadStats {
        UploadStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for UploadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadHandle")
            .field("capacity", &self.capacity)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

/// Retry policy derived from the `[upload]` section.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before an item is abandoned
    pub max_attempts: u32,
    /// First retry delay
    pub base_backoff: Duration,
    /// Retry delay ceiling
    pub max_backoff: Duration,
    /// Thread silence after which an item is dropped
    pub max_age: Duration,
    /// Batch flush period for batched items
    pub batch_interval: Duration,
    /// Bound on one delivery attempt
    pub request_timeout: Duration,
}

impl RetryPolicy {
    /// Build from configuration.
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_age: Duration::from_secs(config.max_age_secs),
            batch_interval: Duration::from_secs(config.batch_interval_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    /// Delay before the attempt following `failures` failed ones, before
    /// jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(20);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    fn jittered_backoff(&self, failures: u32) -> Duration {
        let delay = self.backoff(failures);
        let spread = (delay.as_millis() as u64) / 4;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

struct PendingUpload {
    packet: Arc<SosPacket>,
    thread: ThreadKey,
    failures: u32,
    next_attempt: Instant,
    in_flight: bool,
    /// Cancelled while an attempt was running; dropped when it fails
    cancelled: bool,
}

type AttemptResult = (ContentHash, Result<(), UploadError>);

/// Background delivery worker. Create with [`UploadBridge::new`] and drive
/// with [`UploadBridge::run`].
pub struct UploadBridge {
    backend: Arc<dyn Backend>,
    policy: RetryPolicy,
    queue_capacity: usize,
    max_in_flight: usize,
    commands: mpsc::Receiver<UploadCommand>,
    events: mpsc::UnboundedSender<UploadEvent>,
    counters: Arc<Counters>,
    pending: HashMap<ContentHash, PendingUpload>,
    thread_activity: HashMap<ThreadKey, Instant>,
    attempts: JoinSet<AttemptResult>,
    next_flush: Instant,
}

impl UploadBridge {
    /// Create a bridge, the handle used to feed it, and the event stream it
    /// reports on.
    pub fn new(
        config: &UploadConfig,
        backend: Arc<dyn Backend>,
    ) -> (Self, UploadHandle, mpsc::UnboundedReceiver<UploadEvent>) {
        let capacity = config.queue_capacity.max(1);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let policy = RetryPolicy::from_config(config);

        let bridge = Self {
            backend,
            next_flush: Instant::now() + policy.batch_interval,
            policy,
            queue_capacity: capacity,
            max_in_flight: config.max_in_flight.max(1),
            commands: command_rx,
            events: event_tx,
            counters: Arc::clone(&counters),
            pending: HashMap::new(),
            thread_activity: HashMap::new(),
            attempts: JoinSet::new(),
        };
        let handle = UploadHandle {
            commands: command_tx,
            capacity,
            counters,
        };
        (bridge, handle, event_rx)
    }

    /// Process submissions and deliveries until `shutdown` flips or every
    /// handle is dropped. In-flight attempts are abandoned on exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_attempts = self.policy.max_attempts,
            max_in_flight = self.max_in_flight,
            "upload bridge started"
        );
        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = shutdown.changed() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                Some(joined) = self.attempts.join_next(), if !self.attempts.is_empty() => {
                    match joined {
                        Ok((hash, result)) => self.complete(hash, result),
                        Err(e) => error!("upload attempt task failed: {}", e),
                    }
                }
                _ = sleep_until(wake) => {}
            }
            self.dispatch_due();
        }

        self.attempts.shutdown().await;
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "upload bridge stopped with undelivered packets");
        }
        info!("upload bridge stopped");
    }

    fn next_wake(&self) -> Instant {
        self.pending
            .values()
            .filter(|p| !p.in_flight)
            .map(|p| p.next_attempt)
            .min()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
    }

    fn batch_deadline(&mut self, now: Instant) -> Instant {
        if self.next_flush <= now {
            self.next_flush = now + self.policy.batch_interval;
        }
        self.next_flush
    }

    fn apply(&mut self, command: UploadCommand) {
        let now = Instant::now();
        match command {
            UploadCommand::Submit { packet, hint } => {
                let thread = ThreadKey::of(&packet);
                self.thread_activity.insert(thread.clone(), now);
                let hash = packet.content_hash;

                if let Some(existing) = self.pending.get_mut(&hash) {
                    if packet.hop_count < existing.packet.hop_count {
                        debug!(content_hash = %hash.short(), "pending upload refreshed with closer copy");
                        existing.packet = packet;
                    }
                    return;
                }

                if self.pending.len() >= self.queue_capacity {
                    warn!(content_hash = %hash.short(), "upload queue full, dropping packet");
                    self.abandon(hash, "upload queue full".to_string());
                    return;
                }

                let next_attempt = match hint {
                    UploadHint::Immediate => now,
                    UploadHint::Batched => self.batch_deadline(now),
                };
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.pending.insert(
                    hash,
                    PendingUpload {
                        packet,
                        thread,
                        failures: 0,
                        next_attempt,
                        in_flight: false,
                        cancelled: false,
                    },
                );
                self.sync_pending();
            }
            UploadCommand::Cancel { content_hash } => {
                let Some(item) = self.pending.get_mut(&content_hash) else {
                    return;
                };
                if item.cancelled {
                    return;
                }
                // An attempt already running is left to finish, never retried
                if item.in_flight {
                    item.cancelled = true;
                } else {
                    self.pending.remove(&content_hash);
                }
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(content_hash = %content_hash.short(), "pending upload cancelled");
                self.sync_pending();
            }
        }
    }

    fn dispatch_due(&mut self) {
        let now = Instant::now();

        let expired: Vec<ContentHash> = self
            .pending
            .iter()
            .filter(|(_, p)| !p.in_flight)
            .filter(|(_, p)| {
                self.thread_activity
                    .get(&p.thread)
                    .map_or(true, |last| now.saturating_duration_since(*last) > self.policy.max_age)
            })
            .map(|(hash, _)| *hash)
            .collect();
        for hash in expired {
            self.pending.remove(&hash);
            error!(content_hash = %hash.short(), "upload dropped, thread expired");
            self.abandon(hash, "thread expired".to_string());
        }
        let max_age = self.policy.max_age;
        self.thread_activity
            .retain(|_, last| now.saturating_duration_since(*last) <= max_age);

        let available = self.max_in_flight.saturating_sub(self.attempts.len());
        if available == 0 {
            return;
        }
        let mut due: Vec<(u32, ContentHash)> = self
            .pending
            .iter()
            .filter(|(_, p)| !p.in_flight && p.next_attempt <= now)
            .map(|(hash, p)| (p.packet.priority_score(), *hash))
            .collect();
        due.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, hash) in due.into_iter().take(available) {
            let Some(item) = self.pending.get_mut(&hash) else {
                continue;
            };
            item.in_flight = true;
            let packet = Arc::clone(&item.packet);
            let backend = Arc::clone(&self.backend);
            let timeout = self.policy.request_timeout;
            debug!(packet = %packet, attempt = item.failures + 1, "upload attempt");
            self.attempts.spawn(async move {
                let attempt = tokio::spawn(async move {
                    tokio::time::timeout(timeout, backend.deliver(&packet))
                        .await
                        .unwrap_or(Err(UploadError::Timeout(timeout)))
                });
                let result = attempt
                    .await
                    .unwrap_or_else(|e| Err(UploadError::Backend(format!("delivery task failed: {}", e))));
                (hash, result)
            });
        }
    }

    fn complete(&mut self, hash: ContentHash, result: Result<(), UploadError>) {
        match result {
            Ok(()) => {
                let packet = self.pending.remove(&hash).map(|p| p.packet);
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                self.sync_pending();
                if let Some(packet) = packet {
                    info!(packet = %packet, "packet delivered to backend");
                    let _ = self.events.send(UploadEvent::Delivered {
                        content_hash: hash,
                        packet: Arc::new(packet.acknowledged()),
                    });
                }
            }
            Err(e) => {
                let Some(item) = self.pending.get_mut(&hash) else {
                    return;
                };
                if item.cancelled {
                    self.pending.remove(&hash);
                    self.sync_pending();
                    debug!(content_hash = %hash.short(), "cancelled upload not retried: {}", e);
                    return;
                }
                item.in_flight = false;
                item.failures += 1;
                if item.failures >= self.policy.max_attempts {
                    let failures = item.failures;
                    self.pending.remove(&hash);
                    error!(
                        content_hash = %hash.short(),
                        attempts = failures,
                        "upload abandoned: {}",
                        e
                    );
                    self.abandon(hash, format!("gave up after {} attempts: {}", failures, e));
                    return;
                }
                let delay = self.policy.jittered_backoff(item.failures);
                item.next_attempt = Instant::now() + delay;
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    content_hash = %hash.short(),
                    attempt = item.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "upload failed: {}",
                    e
                );
            }
        }
    }

    fn abandon(&mut self, hash: ContentHash, reason: String) {
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        self.sync_pending();
        let _ = self.events.send(UploadEvent::Abandoned {
            content_hash: hash,
            reason,
        });
    }

    fn sync_pending(&self) {
        self.counters
            .pending
            .store(self.pending.len() as u64, Ordering::Relaxed);
    }
}
