//! Server-wide statistics
//!
//! Lock-free counters bumped from many tasks; readers take snapshots and
//! may observe mid-update composites, which is fine for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counter block shared across the server.
pub struct ServerStats {
    started: Instant,
    pub connections_accepted: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub video_frames_received: AtomicU64,
    pub audio_frames_received: AtomicU64,
    pub video_frames_sent: AtomicU64,
    pub audio_frames_sent: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            connections_accepted: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            video_frames_received: AtomicU64::new(0),
            audio_frames_received: AtomicU64::new(0),
            video_frames_sent: AtomicU64::new(0),
            audio_frames_sent: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Plain-struct snapshot of all counters.
    pub fn snapshot(&self, current_connections: usize) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            current_connections,
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            video_frames_received: self.video_frames_received.load(Ordering::Relaxed),
            audio_frames_received: self.audio_frames_received.load(Ordering::Relaxed),
            video_frames_sent: self.video_frames_sent.load(Ordering::Relaxed),
            audio_frames_sent: self.audio_frames_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub current_connections: usize,
    pub connections_accepted: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub video_frames_received: u64,
    pub audio_frames_received: u64,
    pub video_frames_sent: u64,
    pub audio_frames_sent: u64,
}

impl StatsSnapshot {
    /// Average outbound bitrate over uptime, bits per second.
    pub fn avg_bitrate_bps(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.bytes_sent as f64 * 8.0 / secs
        } else {
            0.0
        }
    }

    /// Average outbound video frame rate over uptime.
    pub fn avg_video_fps(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.video_frames_sent as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const MB: f64 = 1024.0 * 1024.0;
        writeln!(f, "=== Server Statistics ===")?;
        writeln!(f, "Uptime: {}s", self.uptime.as_secs())?;
        writeln!(f, "Current Connections: {}", self.current_connections)?;
        writeln!(f, "Total Connections: {}", self.connections_accepted)?;
        writeln!(f)?;
        writeln!(f, "Messages:")?;
        writeln!(f, "  Received: {}", self.messages_received)?;
        writeln!(f, "  Sent: {}", self.messages_sent)?;
        writeln!(f)?;
        writeln!(f, "Bytes:")?;
        writeln!(
            f,
            "  Received: {} bytes ({:.2} MB)",
            self.bytes_received,
            self.bytes_received as f64 / MB
        )?;
        writeln!(
            f,
            "  Sent: {} bytes ({:.2} MB)",
            self.bytes_sent,
            self.bytes_sent as f64 / MB
        )?;
        writeln!(f)?;
        writeln!(f, "Frames:")?;
        writeln!(f, "  Video Received: {}", self.video_frames_received)?;
        writeln!(f, "  Audio Received: {}", self.audio_frames_received)?;
        writeln!(f, "  Video Sent: {}", self.video_frames_sent)?;
        writeln!(f, "  Audio Sent: {}", self.audio_frames_sent)?;
        if self.uptime.as_secs() > 0 {
            writeln!(f)?;
            writeln!(f, "Performance:")?;
            writeln!(
                f,
                "  Avg Bitrate: {:.2} Mbps",
                self.avg_bitrate_bps() / 1_000_000.0
            )?;
            writeln!(f, "  Avg Video FPS: {:.1} fps", self.avg_video_fps())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_counters() {
        let stats = ServerStats::new();
        stats.messages_sent.fetch_add(3, Ordering::Relaxed);
        stats.bytes_sent.fetch_add(4096, Ordering::Relaxed);
        stats.connections_accepted.fetch_add(2, Ordering::Relaxed);

        let snap = stats.snapshot(1);
        assert_eq!(snap.messages_sent, 3);
        assert_eq!(snap.bytes_sent, 4096);
        assert_eq!(snap.connections_accepted, 2);
        assert_eq!(snap.current_connections, 1);
    }

    #[test]
    fn report_mentions_key_sections() {
        let stats = ServerStats::new();
        stats.messages_received.fetch_add(10, Ordering::Relaxed);
        let text = stats.snapshot(0).to_string();
        assert!(text.contains("Server Statistics"));
        assert!(text.contains("Messages:"));
        assert!(text.contains("Received: 10"));
        assert!(text.contains("Frames:"));
    }
}
