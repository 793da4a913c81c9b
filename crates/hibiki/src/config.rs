//! Server configuration

use serde::{Deserialize, Serialize};

use crate::capture::{AudioCaptureConfig, VideoCaptureConfig};
use crate::distribute::BitratePolicy;
use crate::encode::EncoderConfig;

/// Everything that shapes a running server.
///
/// Defaults match a small deployment: port 8888 on all interfaces,
/// 256 KiB socket and ring buffers, four workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen port (0 picks an ephemeral port)
    pub port: u16,
    /// Bind address; `0.0.0.0` means all interfaces
    pub listen_addr: String,
    /// Hard cap on concurrent connections; excess accepts are closed
    pub max_connections: usize,
    /// Kernel listen backlog
    pub listen_backlog: u32,

    /// Socket receive buffer and per-connection ring size, in bytes
    pub recv_buffer_size: usize,
    /// Socket send buffer size, in bytes
    pub send_buffer_size: usize,

    /// Socket receive timeout in milliseconds; 0 disables
    pub recv_timeout_ms: u64,
    /// Socket send timeout in milliseconds; 0 disables
    pub send_timeout_ms: u64,

    /// How often the server pings idle peers
    pub heartbeat_interval_ms: u64,
    /// Last-activity age beyond which a peer is reaped
    pub heartbeat_timeout_ms: u64,

    /// Worker pool size for connection receive tasks
    pub thread_pool_size: usize,

    /// Bound on the pipeline output queue
    pub pipeline_queue_len: usize,
    /// Bound on each connection's send queue
    pub send_queue_len: usize,

    /// Bitrate cap assigned to subscribers at connect time, in bps
    pub default_bitrate_cap: u32,
    /// How active subscriber caps aggregate into the encoder target
    pub bitrate_policy: BitratePolicy,

    pub video: VideoCaptureConfig,
    pub audio: AudioCaptureConfig,
    pub encoder: EncoderConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            listen_addr: "0.0.0.0".to_string(),
            max_connections: 1000,
            listen_backlog: 128,
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            recv_timeout_ms: 0,
            send_timeout_ms: 0,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            thread_pool_size: 4,
            pipeline_queue_len: 256,
            send_queue_len: 256,
            default_bitrate_cap: 5_000_000,
            bitrate_policy: BitratePolicy::Minimum,
            video: VideoCaptureConfig::default(),
            audio: AudioCaptureConfig::default(),
            encoder: EncoderConfig::default(),
        }
    }
}
