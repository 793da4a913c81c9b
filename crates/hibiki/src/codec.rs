//! Codec instances behind a fixed capability set
//!
//! Each codec exposes init, encode, decode, set-bitrate, flush, and
//! close. The variant is selected by the [`Codec`] tag at construction;
//! the transform itself is simulated (size scaled by the quality tier,
//! timestamps preserved), so a real backend slots in without changing
//! the [`Encoder`](crate::encode::Encoder) above it.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::encode::QualityTier;
use crate::frame::{Codec, MediaFrame};

/// Encoder parameters fixed at init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VideoParams {
    width: u32,
    height: u32,
    framerate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AudioParams {
    sample_rate: u32,
    channels: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode<P> {
    Closed,
    Encoder(P),
    Decoder,
}

/// A video codec instance (H.264, H.265, or VP9 tag).
pub struct VideoCodec {
    codec: Codec,
    mode: Mutex<Mode<VideoParams>>,
    bitrate: AtomicU32,
    quality: AtomicU8,
}

impl VideoCodec {
    /// Create a codec for `codec`. Init fails later if the tag is not a
    /// video codec.
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            mode: Mutex::new(Mode::Closed),
            bitrate: AtomicU32::new(0),
            quality: AtomicU8::new(80),
        }
    }

    /// Prepare for encoding. Must precede `encode`.
    pub fn init_encoder(
        &self,
        width: u32,
        height: u32,
        bitrate: u32,
        framerate: u32,
    ) -> bool {
        if !self.codec.is_video() || width == 0 || height == 0 {
            warn!(codec = self.codec.name(), "video encoder init rejected");
            return false;
        }
        *self.mode.lock().unwrap() = Mode::Encoder(VideoParams {
            width,
            height,
            framerate,
        });
        self.bitrate.store(bitrate, Ordering::SeqCst);
        debug!(
            codec = self.codec.name(),
            width, height, bitrate, framerate, "video encoder initialized"
        );
        true
    }

    /// Prepare for decoding; stream parameters come from the data.
    pub fn init_decoder(&self) -> bool {
        if !self.codec.is_video() {
            return false;
        }
        *self.mode.lock().unwrap() = Mode::Decoder;
        true
    }

    /// Encode one raw frame. Fails unless `init_encoder` ran.
    pub fn encode(&self, input: &MediaFrame, output: &mut MediaFrame) -> bool {
        let params = match *self.mode.lock().unwrap() {
            Mode::Encoder(params) => params,
            _ => return false,
        };
        if input.payload.is_empty() {
            return false;
        }

        let quality = self.quality.load(Ordering::SeqCst);
        let ratio = QualityTier::from_quality(quality).ratio();

        output.kind = input.kind;
        output.codec = self.codec;
        output.width = params.width;
        output.height = params.height;
        output.timestamp_ms = input.timestamp_ms;
        output.pts = input.pts;
        output.bitrate = self.bitrate.load(Ordering::SeqCst);
        output.quality = quality;

        scale_payload(input, output, encoded_len(input.payload.len(), ratio));
        true
    }

    /// Decode one coded frame back to (simulated) raw data.
    pub fn decode(&self, input: &MediaFrame, output: &mut MediaFrame) -> bool {
        if !matches!(*self.mode.lock().unwrap(), Mode::Decoder) || input.payload.is_empty() {
            return false;
        }

        let ratio = QualityTier::from_quality(input.quality).ratio();

        output.kind = input.kind;
        output.codec = self.codec;
        output.width = input.width;
        output.height = input.height;
        output.timestamp_ms = input.timestamp_ms;
        output.pts = input.pts;
        output.quality = input.quality;

        // Inverse of the encode scaling
        scale_payload(input, output, decoded_len(input.payload.len(), ratio));
        true
    }

    pub fn codec_type(&self) -> Codec {
        self.codec
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate.load(Ordering::SeqCst)
    }

    /// Retarget the bitrate mid-stream. Fails when closed.
    pub fn set_bitrate(&self, bitrate: u32) -> bool {
        if matches!(*self.mode.lock().unwrap(), Mode::Closed) {
            return false;
        }
        self.bitrate.store(bitrate, Ordering::SeqCst);
        true
    }

    /// Set the quality level driving the size tier.
    pub fn set_quality(&self, quality: u8) {
        self.quality.store(quality.min(100), Ordering::SeqCst);
    }

    /// Drop any buffered coder state.
    pub fn flush(&self) {
        // The simulated transform is stateless per frame
        debug!(codec = self.codec.name(), "video codec flushed");
    }

    /// Release the instance; further calls fail until re-init.
    pub fn close(&self) {
        *self.mode.lock().unwrap() = Mode::Closed;
        debug!(codec = self.codec.name(), "video codec closed");
    }

    pub fn is_open(&self) -> bool {
        !matches!(*self.mode.lock().unwrap(), Mode::Closed)
    }
}

/// An audio codec instance (AAC or MP3 tag).
pub struct AudioCodec {
    codec: Codec,
    mode: Mutex<Mode<AudioParams>>,
    bitrate: AtomicU32,
    quality: AtomicU8,
}

impl AudioCodec {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            mode: Mutex::new(Mode::Closed),
            bitrate: AtomicU32::new(0),
            quality: AtomicU8::new(80),
        }
    }

    /// Prepare for encoding. Sample format must match the input frames.
    pub fn init_encoder(&self, sample_rate: u32, channels: u32, bitrate: u32) -> bool {
        if !self.codec.is_audio() || sample_rate == 0 || channels == 0 {
            warn!(codec = self.codec.name(), "audio encoder init rejected");
            return false;
        }
        *self.mode.lock().unwrap() = Mode::Encoder(AudioParams {
            sample_rate,
            channels,
        });
        self.bitrate.store(bitrate, Ordering::SeqCst);
        debug!(
            codec = self.codec.name(),
            sample_rate, channels, bitrate, "audio encoder initialized"
        );
        true
    }

    pub fn init_decoder(&self) -> bool {
        if !self.codec.is_audio() {
            return false;
        }
        *self.mode.lock().unwrap() = Mode::Decoder;
        true
    }

    pub fn encode(&self, input: &MediaFrame, output: &mut MediaFrame) -> bool {
        let params = match *self.mode.lock().unwrap() {
            Mode::Encoder(params) => params,
            _ => return false,
        };
        if input.payload.is_empty() {
            return false;
        }

        let quality = self.quality.load(Ordering::SeqCst);
        let ratio = QualityTier::from_quality(quality).ratio();

        output.kind = input.kind;
        output.codec = self.codec;
        output.sample_rate = params.sample_rate;
        output.channels = params.channels;
        output.timestamp_ms = input.timestamp_ms;
        output.pts = input.pts;
        output.bitrate = self.bitrate.load(Ordering::SeqCst);
        output.quality = quality;

        scale_payload(input, output, encoded_len(input.payload.len(), ratio));
        true
    }

    pub fn decode(&self, input: &MediaFrame, output: &mut MediaFrame) -> bool {
        if !matches!(*self.mode.lock().unwrap(), Mode::Decoder) || input.payload.is_empty() {
            return false;
        }

        let ratio = QualityTier::from_quality(input.quality).ratio();

        output.kind = input.kind;
        output.codec = self.codec;
        output.sample_rate = input.sample_rate;
        output.channels = input.channels;
        output.timestamp_ms = input.timestamp_ms;
        output.pts = input.pts;
        output.quality = input.quality;

        scale_payload(input, output, decoded_len(input.payload.len(), ratio));
        true
    }

    pub fn codec_type(&self) -> Codec {
        self.codec
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate.load(Ordering::SeqCst)
    }

    pub fn set_bitrate(&self, bitrate: u32) -> bool {
        if matches!(*self.mode.lock().unwrap(), Mode::Closed) {
            return false;
        }
        self.bitrate.store(bitrate, Ordering::SeqCst);
        true
    }

    pub fn set_quality(&self, quality: u8) {
        self.quality.store(quality.min(100), Ordering::SeqCst);
    }

    pub fn flush(&self) {
        debug!(codec = self.codec.name(), "audio codec flushed");
    }

    pub fn close(&self) {
        *self.mode.lock().unwrap() = Mode::Closed;
        debug!(codec = self.codec.name(), "audio codec closed");
    }

    pub fn is_open(&self) -> bool {
        !matches!(*self.mode.lock().unwrap(), Mode::Closed)
    }
}

/// Size of the simulated coded output for an input of `len` bytes.
fn encoded_len(len: usize, ratio: f64) -> usize {
    ((len as f64 * ratio) as usize).max(8)
}

/// Size of the simulated decoded output for coded input of `len` bytes.
fn decoded_len(len: usize, ratio: f64) -> usize {
    ((len as f64 / ratio).round() as usize).max(8)
}

/// Write a size-scaled stand-in for transformed data: the input prefix,
/// truncated or zero-padded to `out_len`.
fn scale_payload(input: &MediaFrame, output: &mut MediaFrame, out_len: usize) {
    output.payload.clear();
    let copy = out_len.min(input.payload.len());
    output.payload.extend_from_slice(&input.payload[..copy]);
    output.payload.resize(out_len, 0);
}
