//! Server facade
//!
//! Wires capture, encoder, pipeline, distributor, and the TCP endpoint
//! together; routes inbound messages by type; runs the heartbeat reaper
//! and the periodic stats log.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{AudioSource, VideoSource};
use crate::config::ServerConfig;
use crate::distribute::{Distributor, DistributorStats, SubscriberRegistry, SubscriberSession};
use crate::encode::Encoder;
use crate::frame::FramePool;
use crate::net::{Connection, ConnectionHandler, TcpEndpoint};
use crate::pipeline::PipelineProcessor;
use crate::protocol::{timestamp_now_ms, Message, MessageType};
use crate::stats::{ServerStats, StatsSnapshot};

/// Routes connection events into the registries, encoder, and stats.
struct ServerHandler {
    config: ServerConfig,
    stats: Arc<ServerStats>,
    subscribers: Arc<SubscriberRegistry>,
    encoder: Arc<Encoder>,
}

impl ServerHandler {
    fn ack(&self, conn: &Arc<Connection>) {
        let _ = conn.enqueue(Message::control(MessageType::Ack, timestamp_now_ms()));
    }

    /// Re-aggregate active caps and retarget the encoder.
    fn apply_bitrate_policy(&self) {
        if let Some(target) = self
            .subscribers
            .aggregate_cap(self.config.bitrate_policy)
        {
            self.encoder.set_target_bitrate(target);
        }
    }

    fn handle_set_bitrate(&self, conn: &Arc<Connection>, msg: &Message) {
        if msg.payload.len() < 4 {
            warn!(conn = conn.id(), "set-bitrate payload too short");
            self.ack(conn);
            return;
        }
        let bitrate = u32::from_le_bytes([
            msg.payload[0],
            msg.payload[1],
            msg.payload[2],
            msg.payload[3],
        ]);
        info!(conn = conn.id(), bitrate, "set-bitrate request");

        self.subscribers.set_bitrate_cap(conn.id(), bitrate);
        self.apply_bitrate_policy();
        self.ack(conn);
    }

    fn handle_set_quality(&self, conn: &Arc<Connection>, msg: &Message) {
        if msg.payload.is_empty() {
            warn!(conn = conn.id(), "set-quality payload empty");
            self.ack(conn);
            return;
        }
        self.encoder.set_quality(msg.payload[0]);
        self.ack(conn);
    }
}

#[async_trait]
impl ConnectionHandler for ServerHandler {
    async fn on_connect(&self, conn: &Arc<Connection>) {
        self.stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        self.subscribers.register(
            conn.id(),
            conn.peer_addr().to_string(),
            self.config.default_bitrate_cap,
        );

        // Welcome acknowledgement
        self.ack(conn);
    }

    async fn on_message(&self, conn: &Arc<Connection>, msg: Message) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(msg.total_len() as u64, Ordering::Relaxed);

        match msg.message_type() {
            Some(MessageType::VideoFrame) => {
                // Inbound media is only counted; this server is the producer
                self.stats
                    .video_frames_received
                    .fetch_add(1, Ordering::Relaxed);
            }
            Some(MessageType::AudioFrame) => {
                self.stats
                    .audio_frames_received
                    .fetch_add(1, Ordering::Relaxed);
            }
            Some(MessageType::StartStream) => {
                info!(conn = conn.id(), "start-stream request");
                self.ack(conn);
            }
            Some(MessageType::StopStream) => {
                info!(conn = conn.id(), "stop-stream request");
                self.ack(conn);
            }
            Some(MessageType::SetBitrate) => self.handle_set_bitrate(conn, &msg),
            Some(MessageType::SetQuality) => self.handle_set_quality(conn, &msg),
            Some(MessageType::Heartbeat) => {
                let _ = conn.send_heartbeat_ack();
            }
            Some(other) => {
                debug!(conn = conn.id(), msg_type = other.name(), "message ignored");
            }
            None => {
                warn!(
                    conn = conn.id(),
                    msg_type = msg.header.msg_type,
                    "unknown message type ignored"
                );
            }
        }
    }

    async fn on_disconnect(&self, conn: &Arc<Connection>) {
        self.subscribers.unregister(conn.id());
        // The floor may have changed with this subscriber gone
        self.apply_bitrate_policy();
    }
}

/// The A/V streaming server.
///
/// `start` brings components up in dependency order (capture → encoder →
/// pipeline → distributor → endpoint → stats task); `stop` reverses it.
pub struct AvServer {
    config: ServerConfig,
    stats: Arc<ServerStats>,
    pool: Arc<FramePool>,
    video: Arc<VideoSource>,
    audio: Arc<AudioSource>,
    encoder: Arc<Encoder>,
    pipeline: PipelineProcessor,
    subscribers: Arc<SubscriberRegistry>,
    distributor: Distributor,
    endpoint: Arc<TcpEndpoint>,

    running: AtomicBool,
    cancel: CancellationToken,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl AvServer {
    pub fn new(config: ServerConfig) -> Self {
        let stats = Arc::new(ServerStats::new());
        let pool = Arc::new(FramePool::default());
        let video = Arc::new(VideoSource::new(config.video.clone(), Arc::clone(&pool)));
        let audio = Arc::new(AudioSource::new(config.audio.clone(), Arc::clone(&pool)));
        let encoder = Arc::new(Encoder::new(config.encoder.clone()));
        let subscribers = Arc::new(SubscriberRegistry::new());

        let pipeline = PipelineProcessor::new(
            Arc::clone(&video),
            Arc::clone(&audio),
            Arc::clone(&encoder),
            Arc::clone(&pool),
            config.pipeline_queue_len,
        );

        let handler = Arc::new(ServerHandler {
            config: config.clone(),
            stats: Arc::clone(&stats),
            subscribers: Arc::clone(&subscribers),
            encoder: Arc::clone(&encoder),
        });
        let endpoint = Arc::new(TcpEndpoint::new(config.clone(), handler));

        let distributor = Distributor::new(
            pipeline.output(),
            Arc::clone(&subscribers),
            endpoint.connections(),
            Arc::clone(&stats),
        );

        Self {
            config,
            stats,
            pool,
            video,
            audio,
            encoder,
            pipeline,
            subscribers,
            distributor,
            endpoint,
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            stats_task: Mutex::new(None),
        }
    }

    /// Start every component. Fails without entering the running state if
    /// capture cannot open or the endpoint cannot bind.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("starting server");

        if let Err(e) = self.video.start() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e).context("video capture failed to start");
        }
        if let Err(e) = self.audio.start() {
            self.video.stop().await;
            self.running.store(false, Ordering::SeqCst);
            return Err(e).context("audio capture failed to start");
        }

        self.encoder.start();
        self.pipeline.start();
        self.distributor.start();

        if let Err(e) = self.endpoint.start() {
            self.distributor.stop().await;
            self.pipeline.stop().await;
            self.encoder.stop();
            self.audio.stop().await;
            self.video.stop().await;
            self.running.store(false, Ordering::SeqCst);
            return Err(e).context("endpoint failed to start");
        }

        self.spawn_stats_task();

        info!(
            addr = %self
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "?".into()),
            "server running"
        );
        Ok(())
    }

    /// Stop everything in reverse startup order. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("stopping server");
        self.cancel.cancel();
        let handle = self.stats_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.endpoint.stop().await;
        self.distributor.stop().await;
        self.pipeline.stop().await;
        self.encoder.stop();
        self.audio.stop().await;
        self.video.stop().await;

        info!(
            "final statistics:\n{}",
            self.stats.snapshot(self.connection_count())
        );
        info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bound address, once started (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.endpoint.connections().len()
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot(self.connection_count())
    }

    pub fn subscriber_sessions(&self) -> Vec<SubscriberSession> {
        self.subscribers.snapshot()
    }

    pub fn distributor_stats(&self) -> DistributorStats {
        self.distributor.stats()
    }

    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.encoder
    }

    /// Send one message to every live connection.
    pub fn broadcast(&self, msg: &Message) {
        for conn in self.endpoint.connections().snapshot() {
            if conn.is_connected() {
                let _ = conn.enqueue(msg.clone());
            }
        }
    }

    /// Send a message to one connection by id.
    pub fn send_to(&self, id: u32, msg: Message) -> bool {
        match self.endpoint.connections().get(id) {
            Some(conn) => conn.enqueue(msg).is_ok(),
            None => false,
        }
    }

    /// Multi-section report across every component.
    pub fn comprehensive_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.statistics());

        let _ = writeln!(out, "=== Capture ===");
        let _ = writeln!(
            out,
            "Video: {} captured, {} dropped, queue {}",
            self.video.frames_captured(),
            self.video.frames_dropped(),
            self.video.queue_len(),
        );
        let _ = writeln!(
            out,
            "Audio: {} captured, {} dropped, queue {}",
            self.audio.frames_captured(),
            self.audio.frames_dropped(),
            self.audio.queue_len(),
        );
        let (acquired, released) = self.pool.counters();
        let _ = writeln!(
            out,
            "Frame pool: {} free, {} acquired, {} released",
            self.pool.available(),
            acquired,
            released,
        );

        let _ = writeln!(out, "\n=== Encoder ===");
        let _ = writeln!(out, "{}", self.encoder.stats());

        let _ = writeln!(out, "\n=== Pipeline ===");
        let _ = writeln!(out, "{}", self.pipeline.stats());

        let dist = self.distributor.stats();
        let _ = writeln!(out, "\n=== Distribution ===");
        let _ = writeln!(
            out,
            "Subscribers: {}/{} active, {} messages, {:.2} MB, {} drops",
            dist.active_subscribers,
            dist.total_subscribers,
            dist.messages_distributed,
            dist.bytes_distributed as f64 / (1024.0 * 1024.0),
            dist.send_drops,
        );

        let _ = writeln!(out, "\n=== Subscribers ===");
        for session in self.subscriber_sessions() {
            let _ = writeln!(
                out,
                "  #{} {} | cap {:.2} Mbps | actual {:.2} Mbps | {}s | {:.2} MB sent",
                session.id,
                session.addr,
                session.bitrate_cap as f64 / 1_000_000.0,
                session.actual_bitrate() as f64 / 1_000_000.0,
                session.duration().as_secs(),
                session.bytes_sent as f64 / (1024.0 * 1024.0),
            );
        }
        out
    }

    /// Heartbeat/reaper plus the periodic performance log line.
    fn spawn_stats_task(&self) {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms.max(100));
        let timeout = Duration::from_millis(self.config.heartbeat_timeout_ms.max(100));
        let connections = self.endpoint.connections();
        let subscribers = Arc::clone(&self.subscribers);
        let pipeline_out = self.pipeline.output();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_log = tokio::time::Instant::now();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for conn in connections.snapshot() {
                    if conn.is_timed_out(timeout) {
                        warn!(
                            conn = conn.id(),
                            peer = conn.peer_addr(),
                            "peer timed out, closing"
                        );
                        conn.close();
                    } else {
                        let _ = conn.send_heartbeat();
                    }
                }

                if last_log.elapsed() >= Duration::from_secs(10) {
                    last_log = tokio::time::Instant::now();
                    info!(
                        subscribers = subscribers.count(),
                        queue = pipeline_out.len(),
                        connections = connections.len(),
                        "performance monitor"
                    );
                }
            }
            debug!("stats task exiting");
        });
        *self.stats_task.lock().unwrap() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SourceKind;

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.port = 0;
        config.listen_addr = "127.0.0.1".to_string();
        config.video.fps = 10;
        config.video.bitrate = 80_000;
        config
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let server = AvServer::new(test_config());
        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(server.local_addr().is_some());

        // Second start is a no-op
        server.start().await.unwrap();

        server.stop().await;
        assert!(!server.is_running());
        server.stop().await;
    }

    #[tokio::test]
    async fn start_fails_when_capture_cannot_open() {
        let mut config = test_config();
        config.video.kind = SourceKind::Camera;
        let server = AvServer::new(config);

        assert!(server.start().await.is_err());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn start_fails_on_unparseable_listen_addr() {
        let mut config = test_config();
        config.listen_addr = "not an address".to_string();
        let server = AvServer::new(config);

        assert!(server.start().await.is_err());
        assert!(!server.is_running());
        server.stop().await;
    }

    #[tokio::test]
    async fn bind_conflict_fails_cleanly() {
        let first = AvServer::new(test_config());
        first.start().await.unwrap();
        let port = first.local_addr().unwrap().port();

        let mut config = test_config();
        config.port = port;
        let second = AvServer::new(config);
        assert!(second.start().await.is_err());
        assert!(!second.is_running());

        first.stop().await;
    }

    #[tokio::test]
    async fn comprehensive_report_has_all_sections() {
        let server = AvServer::new(test_config());
        server.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = server.comprehensive_report();
        assert!(report.contains("Server Statistics"));
        assert!(report.contains("=== Capture ==="));
        assert!(report.contains("=== Encoder ==="));
        assert!(report.contains("=== Pipeline ==="));
        assert!(report.contains("=== Distribution ==="));

        server.stop().await;
    }
}
