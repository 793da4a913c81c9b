//! Simulated A/V encoder
//!
//! Session-level wrapper over one video and one audio codec instance.
//! The contract a real backend would also satisfy: output timestamps
//! equal input timestamps, output size is a deterministic function of
//! the input size and the active quality tier, and bitrate/quality
//! settings apply from the next call onward.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::{AudioCodec, VideoCodec};
use crate::frame::{Codec, MediaFrame};

/// Encoder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Quality level 0-100; selects the quality tier
    pub quality: u8,
    /// Target bitrate in bits per second
    pub target_bitrate: u32,
    /// Keyframe interval in seconds (advisory for real codecs)
    pub keyframe_interval_s: u32,
    /// Video codec variant
    pub video_codec: Codec,
    /// Audio codec variant
    pub audio_codec: Codec,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: 80,
            target_bitrate: 5_000_000,
            keyframe_interval_s: 2,
            video_codec: Codec::H264,
            audio_codec: Codec::Aac,
        }
    }
}

/// Output-to-input size ratio band, selected by the quality setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTier {
    High,
    Medium,
    Low,
}

impl QualityTier {
    /// Tier for a 0-100 quality level.
    pub fn from_quality(quality: u8) -> Self {
        if quality >= 80 {
            QualityTier::High
        } else if quality >= 50 {
            QualityTier::Medium
        } else {
            QualityTier::Low
        }
    }

    /// Encoded-size / input-size ratio for this tier.
    pub fn ratio(self) -> f64 {
        match self {
            QualityTier::High => 0.75,
            QualityTier::Medium => 0.60,
            QualityTier::Low => 0.40,
        }
    }
}

/// Snapshot of encoder counters.
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_in: u64,
    pub frames_encoded: u64,
    pub failed_encodings: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Exponential moving average of per-frame encode latency
    pub avg_encode_ms: f64,
    /// Average output bitrate over encoder uptime
    pub avg_bitrate_bps: f64,
}

impl EncoderStats {
    /// Input/output size ratio (1.0 when nothing encoded yet).
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_out == 0 {
            1.0
        } else {
            self.bytes_in as f64 / self.bytes_out as f64
        }
    }
}

impl std::fmt::Display for EncoderStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frames {}/{} (failed {}), in {:.2} MB, out {:.2} MB, ratio {:.2}:1, \
             {:.2} ms/frame, {:.2} Mbps",
            self.frames_encoded,
            self.frames_in,
            self.failed_encodings,
            self.bytes_in as f64 / (1024.0 * 1024.0),
            self.bytes_out as f64 / (1024.0 * 1024.0),
            self.compression_ratio(),
            self.avg_encode_ms,
            self.avg_bitrate_bps / 1_000_000.0,
        )
    }
}

struct LatencyEma {
    value_ms: f64,
    primed: bool,
}

/// The encoder. All settings are hot-swappable via atomics; the codec
/// instances are initialized lazily from the first frame's format.
pub struct Encoder {
    running: AtomicBool,
    quality: AtomicU8,
    target_bitrate: AtomicU32,

    video_codec: VideoCodec,
    audio_codec: AudioCodec,
    video_format: Mutex<Option<(u32, u32)>>,
    audio_format: Mutex<Option<(u32, u32)>>,

    frames_in: AtomicU64,
    frames_encoded: AtomicU64,
    failed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    latency: Mutex<LatencyEma>,
    started: Mutex<Instant>,
}

impl Encoder {
    const EMA_ALPHA: f64 = 0.1;
    /// Nominal frame rate handed to codec init (the simulated backend
    /// does not pace itself).
    const NOMINAL_FPS: u32 = 30;

    pub fn new(config: EncoderConfig) -> Self {
        let quality = config.quality.min(100);
        let video_codec = VideoCodec::new(config.video_codec);
        let audio_codec = AudioCodec::new(config.audio_codec);
        video_codec.set_quality(quality);
        audio_codec.set_quality(quality);

        info!(
            quality,
            bitrate = config.target_bitrate,
            video = config.video_codec.name(),
            audio = config.audio_codec.name(),
            "encoder initialized"
        );
        Self {
            running: AtomicBool::new(false),
            quality: AtomicU8::new(quality),
            target_bitrate: AtomicU32::new(config.target_bitrate),
            video_codec,
            audio_codec,
            video_format: Mutex::new(None),
            audio_format: Mutex::new(None),
            frames_in: AtomicU64::new(0),
            frames_encoded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            latency: Mutex::new(LatencyEma {
                value_ms: 0.0,
                primed: false,
            }),
            started: Mutex::new(Instant::now()),
        }
    }

    /// Idempotent; resets the uptime reference used for rolling bitrate.
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            *self.started.lock().unwrap() = Instant::now();
            info!("encoder started");
        }
    }

    /// Idempotent. Flushes and closes both codec instances.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.video_codec.flush();
            self.video_codec.close();
            self.audio_codec.flush();
            self.audio_codec.close();
            *self.video_format.lock().unwrap() = None;
            *self.audio_format.lock().unwrap() = None;
            info!("encoder stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Encode a video frame into `output`.
    ///
    /// Returns false (and counts a failure) when the encoder is stopped,
    /// the input carries no payload, or the codec rejects the frame.
    pub fn encode_video(&self, input: &MediaFrame, output: &mut MediaFrame) -> bool {
        if !self.running.load(Ordering::SeqCst) || input.payload.is_empty() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let begin = Instant::now();
        self.frames_in.fetch_add(1, Ordering::Relaxed);

        if !self.ensure_video_codec(input) || !self.video_codec.encode(input, output) {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.finish(input, output, begin);
        true
    }

    /// Encode an audio frame into `output`.
    pub fn encode_audio(&self, input: &MediaFrame, output: &mut MediaFrame) -> bool {
        if !self.running.load(Ordering::SeqCst) || input.payload.is_empty() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let begin = Instant::now();
        self.frames_in.fetch_add(1, Ordering::Relaxed);

        if !self.ensure_audio_codec(input) || !self.audio_codec.encode(input, output) {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        self.finish(input, output, begin);
        true
    }

    /// Retarget the encoder bitrate; applies from the next frame.
    pub fn set_target_bitrate(&self, bitrate: u32) {
        self.target_bitrate.store(bitrate, Ordering::SeqCst);
        self.video_codec.set_bitrate(bitrate);
        self.audio_codec.set_bitrate(bitrate);
        info!(bitrate, "encoder bitrate adjusted");
    }

    pub fn target_bitrate(&self) -> u32 {
        self.target_bitrate.load(Ordering::SeqCst)
    }

    /// Set the quality level (clamped to 0-100); applies from the next frame.
    pub fn set_quality(&self, quality: u8) {
        let quality = quality.min(100);
        self.quality.store(quality, Ordering::SeqCst);
        self.video_codec.set_quality(quality);
        self.audio_codec.set_quality(quality);
        info!(quality, "encoder quality adjusted");
    }

    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> EncoderStats {
        let uptime = self.started.lock().unwrap().elapsed().as_secs_f64();
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);
        let avg_bitrate_bps = if uptime > 0.0 {
            bytes_out as f64 * 8.0 / uptime
        } else {
            0.0
        };
        EncoderStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            failed_encodings: self.failed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out,
            avg_encode_ms: self.latency.lock().unwrap().value_ms,
            avg_bitrate_bps,
        }
    }

    /// Init (or re-init on geometry change) the video codec instance.
    fn ensure_video_codec(&self, input: &MediaFrame) -> bool {
        let mut format = self.video_format.lock().unwrap();
        let wanted = (input.width, input.height);
        if *format == Some(wanted) && self.video_codec.is_open() {
            return true;
        }
        let ok = self.video_codec.init_encoder(
            input.width,
            input.height,
            self.target_bitrate.load(Ordering::SeqCst),
            Self::NOMINAL_FPS,
        );
        if ok {
            *format = Some(wanted);
        }
        ok
    }

    fn ensure_audio_codec(&self, input: &MediaFrame) -> bool {
        let mut format = self.audio_format.lock().unwrap();
        let wanted = (input.sample_rate, input.channels);
        if *format == Some(wanted) && self.audio_codec.is_open() {
            return true;
        }
        let ok = self.audio_codec.init_encoder(
            input.sample_rate,
            input.channels,
            self.target_bitrate.load(Ordering::SeqCst),
        );
        if ok {
            *format = Some(wanted);
        }
        ok
    }

    fn finish(&self, input: &MediaFrame, output: &MediaFrame, begin: Instant) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
        self.bytes_in
            .fetch_add(input.payload.len() as u64, Ordering::Relaxed);
        self.bytes_out
            .fetch_add(output.payload.len() as u64, Ordering::Relaxed);

        let sample_ms = begin.elapsed().as_secs_f64() * 1000.0;
        let mut latency = self.latency.lock().unwrap();
        if latency.primed {
            latency.value_ms =
                latency.value_ms * (1.0 - Self::EMA_ALPHA) + sample_ms * Self::EMA_ALPHA;
        } else {
            latency.value_ms = sample_ms;
            latency.primed = true;
        }
        drop(latency);

        debug!(
            kind = input.kind.name(),
            in_len = input.payload.len(),
            out_len = output.payload.len(),
            "frame encoded"
        );
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(EncoderConfig::default())
    }
}
