//! Subscriber registry and fan-out distributor
//!
//! The distributor is the sole consumer of the pipeline output queue. For
//! each message it snapshots the subscriber list under a short lock, then
//! enqueues onto each live connection's bounded send queue. Network
//! writes happen on the per-connection writer tasks, so one stuck peer
//! can never hold up the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::net::{Connection, ConnectionRegistry, SendError};
use crate::protocol::{Message, MessageType};
use crate::queue::Fifo;
use crate::stats::ServerStats;

/// How active subscriber caps aggregate into one encoder target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitratePolicy {
    /// Encode for the slowest subscriber (default)
    Minimum,
    /// Encode for the fastest subscriber
    Maximum,
}

impl BitratePolicy {
    /// Fold the active caps into a single target, if any are active.
    pub fn aggregate(self, caps: impl Iterator<Item = u32>) -> Option<u32> {
        match self {
            BitratePolicy::Minimum => caps.min(),
            BitratePolicy::Maximum => caps.max(),
        }
    }
}

/// Distributor-side record of one subscriber.
#[derive(Debug, Clone)]
pub struct SubscriberSession {
    pub id: u32,
    pub addr: String,
    /// Advisory bitrate cap in bits per second
    pub bitrate_cap: u32,
    pub bytes_sent: u64,
    pub messages_sent: u64,
    pub started: Instant,
    pub active: bool,
}

impl SubscriberSession {
    fn new(id: u32, addr: String, bitrate_cap: u32) -> Self {
        Self {
            id,
            addr,
            bitrate_cap,
            bytes_sent: 0,
            messages_sent: 0,
            started: Instant::now(),
            active: true,
        }
    }

    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    /// Observed outbound bitrate over the session so far, bps.
    pub fn actual_bitrate(&self) -> u64 {
        let secs = self.duration().as_secs();
        if secs == 0 {
            0
        } else {
            self.bytes_sent * 8 / secs
        }
    }
}

#[derive(Default)]
struct DistCounters {
    messages_distributed: AtomicU64,
    bytes_distributed: AtomicU64,
    send_drops: AtomicU64,
}

/// Distributor counters snapshot.
#[derive(Debug, Clone, Default)]
pub struct DistributorStats {
    pub active_subscribers: usize,
    pub total_subscribers: u64,
    pub messages_distributed: u64,
    pub bytes_distributed: u64,
    /// Messages dropped because a subscriber's send queue was full
    pub send_drops: u64,
}

/// Per-subscriber session state, keyed by connection id.
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<u32, SubscriberSession>>,
    total_registered: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            total_registered: AtomicU64::new(0),
        }
    }

    pub fn register(&self, id: u32, addr: String, bitrate_cap: u32) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.insert(id, SubscriberSession::new(id, addr.clone(), bitrate_cap));
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        info!(subscriber = id, addr = %addr, bitrate_cap, "subscriber registered");
    }

    pub fn unregister(&self, id: u32) {
        if self.subscribers.lock().unwrap().remove(&id).is_some() {
            info!(subscriber = id, "subscriber unregistered");
        }
    }

    /// Update a subscriber's cap; returns false for an unknown id.
    pub fn set_bitrate_cap(&self, id: u32, bitrate: u32) -> bool {
        let mut subs = self.subscribers.lock().unwrap();
        match subs.get_mut(&id) {
            Some(session) => {
                session.bitrate_cap = bitrate;
                info!(subscriber = id, bitrate, "bitrate cap updated");
                true
            }
            None => false,
        }
    }

    pub fn mark_inactive(&self, id: u32) {
        if let Some(session) = self.subscribers.lock().unwrap().get_mut(&id) {
            session.active = false;
        }
    }

    /// Clone out the sessions; short lock, callers iterate lock-free.
    pub fn snapshot(&self) -> Vec<SubscriberSession> {
        self.subscribers.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, id: u32) -> Option<SubscriberSession> {
        self.subscribers.lock().unwrap().get(&id).cloned()
    }

    pub fn count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    pub fn total_registered(&self) -> u64 {
        self.total_registered.load(Ordering::Relaxed)
    }

    /// Aggregate the caps of active subscribers under `policy`.
    pub fn aggregate_cap(&self, policy: BitratePolicy) -> Option<u32> {
        let subs = self.subscribers.lock().unwrap();
        policy.aggregate(subs.values().filter(|s| s.active).map(|s| s.bitrate_cap))
    }

    fn record_sent(&self, id: u32, bytes: u64) {
        if let Some(session) = self.subscribers.lock().unwrap().get_mut(&id) {
            session.bytes_sent += bytes;
            session.messages_sent += 1;
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fan-out task draining the pipeline output queue.
pub struct Distributor {
    source: Arc<Fifo<Message>>,
    subscribers: Arc<SubscriberRegistry>,
    connections: Arc<ConnectionRegistry>,
    stats: Arc<ServerStats>,
    counters: Arc<DistCounters>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Distributor {
    pub fn new(
        source: Arc<Fifo<Message>>,
        subscribers: Arc<SubscriberRegistry>,
        connections: Arc<ConnectionRegistry>,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            source,
            subscribers,
            connections,
            stats,
            counters: Arc::new(DistCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the fan-out task. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("distributor started");

        let source = Arc::clone(&self.source);
        let subscribers = Arc::clone(&self.subscribers);
        let connections = Arc::clone(&self.connections);
        let stats = Arc::clone(&self.stats);
        let counters = Arc::clone(&self.counters);
        let running = Arc::clone(&self.running);

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match source.pop_for(Duration::from_millis(1)).await {
                    Some(msg) => {
                        Self::distribute(&msg, &subscribers, &connections, &stats, &counters);
                    }
                    None => {
                        if source.is_shutdown() && source.is_empty() {
                            // Producer is gone; idle until stopped
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        }
                    }
                }
            }
            debug!("distributor task exiting");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the task. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("distributor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DistributorStats {
        DistributorStats {
            active_subscribers: self.subscribers.count(),
            total_subscribers: self.subscribers.total_registered(),
            messages_distributed: self.counters.messages_distributed.load(Ordering::Relaxed),
            bytes_distributed: self.counters.bytes_distributed.load(Ordering::Relaxed),
            send_drops: self.counters.send_drops.load(Ordering::Relaxed),
        }
    }

    fn distribute(
        msg: &Message,
        subscribers: &SubscriberRegistry,
        connections: &ConnectionRegistry,
        stats: &ServerStats,
        counters: &DistCounters,
    ) {
        let sessions = subscribers.snapshot();
        if sessions.is_empty() {
            return;
        }

        let msg_len = msg.total_len() as u64;
        let msg_type = msg.message_type();

        for session in sessions.iter().filter(|s| s.active) {
            let conn: Option<Arc<Connection>> = connections.get(session.id);
            let conn = match conn {
                Some(conn) if conn.is_connected() => conn,
                _ => {
                    subscribers.mark_inactive(session.id);
                    continue;
                }
            };

            match conn.enqueue(msg.clone()) {
                Ok(()) => {
                    subscribers.record_sent(session.id, msg_len);
                    counters
                        .messages_distributed
                        .fetch_add(1, Ordering::Relaxed);
                    counters.bytes_distributed.fetch_add(msg_len, Ordering::Relaxed);
                    stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_sent.fetch_add(msg_len, Ordering::Relaxed);
                    match msg_type {
                        Some(MessageType::VideoFrame) => {
                            stats.video_frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(MessageType::AudioFrame) => {
                            stats.audio_frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                }
                Err(SendError::QueueFull) => {
                    // Slow peer: this message is dropped for them only
                    counters.send_drops.fetch_add(1, Ordering::Relaxed);
                }
                Err(SendError::Closed) => {
                    warn!(subscriber = session.id, "subscriber connection closed");
                    subscribers.mark_inactive(session.id);
                }
            }
        }
    }
}
