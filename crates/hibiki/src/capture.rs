//! Frame capture sources
//!
//! Video and audio producers feeding the pipeline. Device kinds are an
//! adapter boundary: only the synthetic test pattern generates frames in
//! this build; camera, file, and screen sources would plug in behind the
//! same queue without the pipeline noticing.
//!
//! Both sources apply drop-oldest backpressure: when the internal frame
//! queue is full the oldest frame is evicted (and counted) to make room,
//! so a stalled pipeline sees the freshest frames once it resumes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{Codec, FrameKind, FramePool, MediaFrame};
use crate::protocol::timestamp_now_ms;
use crate::queue::Fifo;

/// Kind of capture device behind a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    Camera,
    File,
    Screen,
    /// Synthetic frames, no hardware required
    TestPattern,
}

/// Video capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoCaptureConfig {
    pub kind: SourceKind,
    /// Device id or file path, depending on `kind`
    pub source: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: Codec,
    /// Nominal bitrate in bits per second; sizes synthetic frames
    pub bitrate: u32,
    pub quality: u8,
    /// Keyframe cadence in frames
    pub keyframe_interval: u32,
    /// Frame queue bound (drop-oldest beyond this)
    pub buffer_frames: usize,
}

impl Default for VideoCaptureConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::TestPattern,
            source: "0".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
            codec: Codec::H264,
            bitrate: 5_000_000,
            quality: 80,
            keyframe_interval: 30,
            buffer_frames: 30,
        }
    }
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioCaptureConfig {
    pub kind: SourceKind,
    pub source: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec: Codec,
    pub bitrate: u32,
    pub quality: u8,
    /// Duration of one audio frame in milliseconds
    pub frame_duration_ms: u32,
    pub buffer_frames: usize,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::TestPattern,
            source: "default".to_string(),
            sample_rate: 48_000,
            channels: 2,
            codec: Codec::Aac,
            bitrate: 128_000,
            quality: 80,
            frame_duration_ms: 20,
            buffer_frames: 100,
        }
    }
}

struct SourceShared {
    queue: Fifo<MediaFrame>,
    pool: Arc<FramePool>,
    running: AtomicBool,
    captured: AtomicU64,
    dropped: AtomicU64,
}

impl SourceShared {
    fn new(pool: Arc<FramePool>, buffer_frames: usize) -> Self {
        Self {
            queue: Fifo::bounded(buffer_frames.max(1)),
            pool,
            running: AtomicBool::new(false),
            captured: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, frame: MediaFrame) {
        self.captured.fetch_add(1, Ordering::Relaxed);
        if let Some(evicted) = self.queue.push_evicting(frame) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.pool.release(evicted);
        }
    }
}

/// Video frame producer.
pub struct VideoSource {
    config: VideoCaptureConfig,
    shared: Arc<SourceShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl VideoSource {
    pub fn new(config: VideoCaptureConfig, pool: Arc<FramePool>) -> Self {
        let shared = Arc::new(SourceShared::new(pool, config.buffer_frames));
        Self {
            config,
            shared,
            task: Mutex::new(None),
        }
    }

    /// Open the underlying device.
    ///
    /// Only the test pattern is available in this build; real device
    /// kinds report failure until a capture backend is integrated.
    pub fn open(&self) -> bool {
        match self.config.kind {
            SourceKind::TestPattern => true,
            other => {
                warn!(kind = ?other, "video capture backend not available");
                false
            }
        }
    }

    /// Open the device and start the producer task.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.open() {
            self.shared.running.store(false, Ordering::SeqCst);
            bail!("failed to open video source {:?}", self.config.kind);
        }

        info!(
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            codec = self.config.codec.name(),
            "video capture started"
        );

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let period = Duration::from_micros(1_000_000 / config.fps.max(1) as u64);
            let mut ticker = tokio::time::interval(period);
            let mut frame_num: u64 = 0;

            while shared.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let frame = synth_video_frame(&shared.pool, &config, frame_num);
                shared.enqueue(frame);
                frame_num += 1;

                if frame_num % 300 == 0 {
                    debug!(frames = frame_num, "test pattern frames generated");
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the producer. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.queue.shutdown();
        info!("video capture stopped");
    }

    /// Non-blocking frame fetch.
    pub fn try_frame(&self) -> Option<MediaFrame> {
        self.shared.queue.try_pop()
    }

    /// Wait up to `timeout` for a frame.
    pub async fn frame(&self, timeout: Duration) -> Option<MediaFrame> {
        self.shared.queue.pop_for(timeout).await
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.captured.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &VideoCaptureConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn produce_for_test(&self, frame_num: u64) {
        let frame = synth_video_frame(&self.shared.pool, &self.config, frame_num);
        self.shared.enqueue(frame);
    }
}

/// Audio frame producer.
pub struct AudioSource {
    config: AudioCaptureConfig,
    shared: Arc<SourceShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioSource {
    pub fn new(config: AudioCaptureConfig, pool: Arc<FramePool>) -> Self {
        let shared = Arc::new(SourceShared::new(pool, config.buffer_frames));
        Self {
            config,
            shared,
            task: Mutex::new(None),
        }
    }

    pub fn open(&self) -> bool {
        match self.config.kind {
            SourceKind::TestPattern => true,
            other => {
                warn!(kind = ?other, "audio capture backend not available");
                false
            }
        }
    }

    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.open() {
            self.shared.running.store(false, Ordering::SeqCst);
            bail!("failed to open audio source {:?}", self.config.kind);
        }

        info!(
            sample_rate = self.config.sample_rate,
            channels = self.config.channels,
            codec = self.config.codec.name(),
            "audio capture started"
        );

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            let period = Duration::from_millis(config.frame_duration_ms.max(1) as u64);
            let mut ticker = tokio::time::interval(period);
            let mut frame_num: u64 = 0;

            while shared.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let frame = synth_audio_frame(&shared.pool, &config, frame_num);
                shared.enqueue(frame);
                frame_num += 1;
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.shared.queue.shutdown();
        info!("audio capture stopped");
    }

    pub fn try_frame(&self) -> Option<MediaFrame> {
        self.shared.queue.try_pop()
    }

    pub async fn frame(&self, timeout: Duration) -> Option<MediaFrame> {
        self.shared.queue.pop_for(timeout).await
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.captured.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &AudioCaptureConfig {
        &self.config
    }
}

fn synth_video_frame(
    pool: &FramePool,
    config: &VideoCaptureConfig,
    frame_num: u64,
) -> MediaFrame {
    let mut frame = pool.acquire();

    let keyframe = config.keyframe_interval > 0
        && frame_num % config.keyframe_interval as u64 == 0;
    frame.kind = if keyframe {
        FrameKind::VideoKey
    } else {
        FrameKind::VideoPredicted
    };
    frame.codec = config.codec;
    frame.width = config.width;
    frame.height = config.height;
    frame.bitrate = config.bitrate;
    frame.quality = config.quality;
    frame.timestamp_ms = timestamp_now_ms();
    frame.pts = frame_num * 1000 / config.fps.max(1) as u64;

    // Size from the nominal bitrate; keyframes carry more data
    let base = (config.bitrate / 8 / config.fps.max(1)).max(256) as usize;
    let size = if keyframe { base * 3 } else { base };
    fill_pattern(&mut frame, frame_num, size);
    frame
}

fn synth_audio_frame(
    pool: &FramePool,
    config: &AudioCaptureConfig,
    frame_num: u64,
) -> MediaFrame {
    let mut frame = pool.acquire();

    frame.kind = FrameKind::Audio;
    frame.codec = config.codec;
    frame.sample_rate = config.sample_rate;
    frame.channels = config.channels;
    frame.bitrate = config.bitrate;
    frame.quality = config.quality;
    frame.timestamp_ms = timestamp_now_ms();
    frame.pts = frame_num * config.frame_duration_ms as u64;

    // 16-bit PCM worth of samples for one frame duration
    let samples =
        (config.sample_rate as u64 * config.frame_duration_ms as u64 / 1000).max(1) as usize;
    let size = samples * config.channels as usize * 2;
    fill_pattern(&mut frame, frame_num, size);
    frame
}

fn fill_pattern(frame: &mut MediaFrame, frame_num: u64, size: usize) {
    frame.payload.clear();
    frame.payload.extend_from_slice(&frame_num.to_le_bytes());
    let byte = (frame_num & 0xFF) as u8;
    frame.payload.resize(size.max(8), byte);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> Arc<FramePool> {
        Arc::new(FramePool::new(8, 64 * 1024))
    }

    #[tokio::test]
    async fn open_succeeds_only_for_test_pattern() {
        let pool = test_pool();
        let synthetic = VideoSource::new(VideoCaptureConfig::default(), Arc::clone(&pool));
        assert!(synthetic.open());

        let camera = VideoSource::new(
            VideoCaptureConfig {
                kind: SourceKind::Camera,
                ..Default::default()
            },
            pool,
        );
        assert!(!camera.open());
        assert!(camera.start().is_err());
    }

    #[tokio::test]
    async fn drop_oldest_when_bound_reached() {
        let pool = test_pool();
        let source = VideoSource::new(
            VideoCaptureConfig {
                buffer_frames: 30,
                fps: 30,
                ..Default::default()
            },
            pool,
        );

        // Produce 35 frames with no consumer draining
        for n in 0..35 {
            source.produce_for_test(n);
        }

        assert_eq!(source.frames_captured(), 35);
        assert_eq!(source.frames_dropped(), 5);
        assert_eq!(source.queue_len(), 30);

        // Frames 0..4 were evicted; 5..34 arrive in capture order
        for expected in 5..35u64 {
            let frame = source.try_frame().expect("frame missing");
            let mut tag = [0u8; 8];
            tag.copy_from_slice(&frame.payload[..8]);
            assert_eq!(u64::from_le_bytes(tag), expected);
        }
        assert!(source.try_frame().is_none());
    }

    #[tokio::test]
    async fn generator_produces_frames() {
        let pool = test_pool();
        let source = VideoSource::new(
            VideoCaptureConfig {
                fps: 200,
                bitrate: 400_000,
                ..Default::default()
            },
            pool,
        );
        source.start().unwrap();

        let frame = source
            .frame(Duration::from_secs(2))
            .await
            .expect("no frame from generator");
        assert_eq!(frame.width, 1920);
        assert!(frame.timestamp_ms > 0);
        assert!(!frame.payload.is_empty());

        source.stop().await;
        assert!(!source.is_running());
        // Stop twice is fine
        source.stop().await;
    }

    #[tokio::test]
    async fn keyframe_cadence() {
        let pool = test_pool();
        let source = VideoSource::new(
            VideoCaptureConfig {
                keyframe_interval: 10,
                buffer_frames: 32,
                ..Default::default()
            },
            pool,
        );

        for n in 0..20 {
            source.produce_for_test(n);
        }
        let mut kinds = Vec::new();
        while let Some(frame) = source.try_frame() {
            kinds.push(frame.kind);
        }
        assert_eq!(kinds[0], FrameKind::VideoKey);
        assert_eq!(kinds[10], FrameKind::VideoKey);
        assert!(kinds[1..10]
            .iter()
            .all(|k| *k == FrameKind::VideoPredicted));
    }

    #[tokio::test]
    async fn audio_frames_carry_format() {
        let pool = test_pool();
        let source = AudioSource::new(AudioCaptureConfig::default(), pool);
        source.start().unwrap();

        let frame = source
            .frame(Duration::from_secs(2))
            .await
            .expect("no audio frame");
        assert_eq!(frame.kind, FrameKind::Audio);
        assert_eq!(frame.sample_rate, 48_000);
        assert_eq!(frame.channels, 2);
        // 20ms of 48kHz stereo 16-bit PCM
        assert_eq!(frame.payload.len(), 960 * 2 * 2);

        source.stop().await;
    }
}
