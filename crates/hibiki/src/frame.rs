//! Media frame types and the recycling frame pool

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// Default payload capacity preallocated per pooled frame (1 MiB).
pub const DEFAULT_FRAME_CAPACITY: usize = 1024 * 1024;

/// Kind of a captured or encoded media frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Self-contained coded video frame (I-frame)
    VideoKey,
    /// Forward-predicted video frame (P-frame)
    VideoPredicted,
    /// Bidirectionally predicted video frame (B-frame)
    VideoBidirectional,
    /// Audio frame
    Audio,
}

impl FrameKind {
    pub fn is_video(self) -> bool {
        !matches!(self, FrameKind::Audio)
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameKind::VideoKey => "I-Frame",
            FrameKind::VideoPredicted => "P-Frame",
            FrameKind::VideoBidirectional => "B-Frame",
            FrameKind::Audio => "Audio-Frame",
        }
    }
}

/// Codec a frame's payload is (nominally) coded with.
///
/// The encoder treats payloads as opaque bytes; the tag travels with the
/// frame for logging and codec-info reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    Vp9,
    Aac,
    Mp3,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Codec::H264 => "H.264",
            Codec::H265 => "H.265",
            Codec::Vp9 => "VP9",
            Codec::Aac => "AAC",
            Codec::Mp3 => "MP3",
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, Codec::H264 | Codec::H265 | Codec::Vp9)
    }

    pub fn is_audio(self) -> bool {
        !self.is_video()
    }
}

/// A single unit of media moving through the pipeline.
///
/// Owned exclusively by whichever stage currently holds it; returned to
/// the [`FramePool`] once the encoder (or a test) is done with it.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: FrameKind,
    pub codec: Codec,

    /// Video geometry (zero for audio frames)
    pub width: u32,
    pub height: u32,
    /// Audio format (zero for video frames)
    pub sample_rate: u32,
    pub channels: u32,

    /// Capture timestamp, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Presentation timestamp
    pub pts: u64,

    pub payload: BytesMut,

    /// Declared bitrate in bits per second
    pub bitrate: u32,
    /// Quality level 0-100
    pub quality: u8,
}

impl MediaFrame {
    /// Create an empty frame with the given preallocated payload capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            kind: FrameKind::VideoKey,
            codec: Codec::H264,
            width: 0,
            height: 0,
            sample_rate: 0,
            channels: 0,
            timestamp_ms: 0,
            pts: 0,
            payload: BytesMut::with_capacity(capacity),
            bitrate: 0,
            quality: 80,
        }
    }

    /// Clear payload and timing/format fields, keeping payload capacity.
    pub fn reset(&mut self) {
        self.payload.clear();
        self.timestamp_ms = 0;
        self.pts = 0;
        self.width = 0;
        self.height = 0;
        self.sample_rate = 0;
        self.channels = 0;
        self.bitrate = 0;
        self.quality = 80;
    }
}

impl Default for MediaFrame {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FRAME_CAPACITY)
    }
}

/// Recycling pool amortizing frame payload allocations.
///
/// `acquire` never blocks and never fails: an empty pool just allocates.
/// `release` reinserts up to the target count and drops the rest, so the
/// target is a soft ceiling on retained memory.
pub struct FramePool {
    free: Mutex<Vec<MediaFrame>>,
    target: usize,
    frame_capacity: usize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl FramePool {
    /// Create a pool that retains up to `target` recycled frames, each
    /// preallocated with `frame_capacity` payload bytes.
    pub fn new(target: usize, frame_capacity: usize) -> Self {
        let free = (0..target)
            .map(|_| MediaFrame::with_capacity(frame_capacity))
            .collect();
        Self {
            free: Mutex::new(free),
            target,
            frame_capacity,
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Take a frame from the pool, allocating a fresh one if empty.
    ///
    /// The returned frame is logically empty but retains its capacity.
    pub fn acquire(&self) -> MediaFrame {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let recycled = self.free.lock().unwrap().pop();
        match recycled {
            Some(mut frame) => {
                frame.reset();
                frame
            }
            None => MediaFrame::with_capacity(self.frame_capacity),
        }
    }

    /// Return a frame to the pool.
    pub fn release(&self, mut frame: MediaFrame) {
        self.released.fetch_add(1, Ordering::Relaxed);
        frame.reset();
        let mut free = self.free.lock().unwrap();
        if free.len() < self.target {
            free.push(frame);
        }
    }

    /// Number of recycled frames currently available.
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Lifetime (acquire, release) counts.
    pub fn counters(&self) -> (u64, u64) {
        (
            self.acquired.load(Ordering::Relaxed),
            self.released.load(Ordering::Relaxed),
        )
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(10, DEFAULT_FRAME_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquired_frame_is_empty_with_capacity() {
        let pool = FramePool::new(2, 4096);
        let mut frame = pool.acquire();
        frame.payload.extend_from_slice(&[1, 2, 3]);
        frame.timestamp_ms = 99;
        frame.width = 640;
        pool.release(frame);

        let frame = pool.acquire();
        assert!(frame.payload.is_empty());
        assert_eq!(frame.timestamp_ms, 0);
        assert_eq!(frame.width, 0);
        assert!(frame.payload.capacity() >= 4096);
    }

    #[test]
    fn empty_pool_allocates() {
        let pool = FramePool::new(1, 1024);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.available(), 0);
        drop((a, b, c));
    }

    #[test]
    fn release_beyond_target_drops_frames() {
        let pool = FramePool::new(2, 1024);
        let frames: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        for f in frames {
            pool.release(f);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn counters_track_live_checkouts() {
        let pool = FramePool::new(4, 1024);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();

        let (acquired, released) = pool.counters();
        assert_eq!(acquired - released, 3);

        pool.release(a);
        pool.release(b);
        let (acquired, released) = pool.counters();
        assert_eq!(acquired - released, 1);

        pool.release(c);
        let (acquired, released) = pool.counters();
        assert_eq!(acquired, released);
    }
}
