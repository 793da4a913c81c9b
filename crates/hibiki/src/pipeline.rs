//! Capture → encode → message pipeline
//!
//! A single task drains the capture sources, runs frames through the
//! encoder, wraps the coded bytes into protocol messages, and pushes them
//! onto the bounded output queue. The distributor is the sole consumer;
//! when it falls behind the push blocks and this task pauses; the queue
//! never drops from the producer side.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capture::{AudioSource, VideoSource};
use crate::encode::Encoder;
use crate::frame::FramePool;
use crate::protocol::{timestamp_now_ms, Message, MessageType};
use crate::queue::Fifo;

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub video_frames: u64,
    pub audio_frames: u64,
    pub video_bytes: u64,
    pub audio_bytes: u64,
    pub messages_produced: u64,
    pub queue_len: usize,
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "video {} frames/{:.2} MB, audio {} frames/{:.2} MB, {} messages, queue {}",
            self.video_frames,
            self.video_bytes as f64 / (1024.0 * 1024.0),
            self.audio_frames,
            self.audio_bytes as f64 / (1024.0 * 1024.0),
            self.messages_produced,
            self.queue_len,
        )
    }
}

#[derive(Default)]
struct Counters {
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    video_bytes: AtomicU64,
    audio_bytes: AtomicU64,
    messages: AtomicU64,
}

/// The pipeline processor.
pub struct PipelineProcessor {
    video: Arc<VideoSource>,
    audio: Arc<AudioSource>,
    encoder: Arc<Encoder>,
    pool: Arc<FramePool>,
    out: Arc<Fifo<Message>>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineProcessor {
    pub fn new(
        video: Arc<VideoSource>,
        audio: Arc<AudioSource>,
        encoder: Arc<Encoder>,
        pool: Arc<FramePool>,
        queue_len: usize,
    ) -> Self {
        Self {
            video,
            audio,
            encoder,
            pool,
            out: Arc::new(Fifo::bounded(queue_len.max(1))),
            counters: Arc::new(Counters::default()),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// The queue the distributor drains.
    pub fn output(&self) -> Arc<Fifo<Message>> {
        Arc::clone(&self.out)
    }

    /// Spawn the processing task. Idempotent.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("pipeline started");

        let video = Arc::clone(&self.video);
        let audio = Arc::clone(&self.audio);
        let encoder = Arc::clone(&self.encoder);
        let pool = Arc::clone(&self.pool);
        let out = Arc::clone(&self.out);
        let counters = Arc::clone(&self.counters);
        let running = Arc::clone(&self.running);

        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let mut did_work = false;

                if let Some(raw) = video.try_frame() {
                    did_work = true;
                    let ok = Self::process_one(
                        &encoder, &pool, &out, &counters, raw, true,
                    )
                    .await;
                    if !ok {
                        break; // output queue shut down
                    }
                }

                if let Some(raw) = audio.try_frame() {
                    did_work = true;
                    let ok = Self::process_one(
                        &encoder, &pool, &out, &counters, raw, false,
                    )
                    .await;
                    if !ok {
                        break;
                    }
                }

                if !did_work {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
            debug!("pipeline task exiting");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the task and close the output queue. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Closing the queue also releases a producer blocked on a full
        // queue with no remaining consumer.
        self.out.shutdown();
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            video_frames: self.counters.video_frames.load(Ordering::Relaxed),
            audio_frames: self.counters.audio_frames.load(Ordering::Relaxed),
            video_bytes: self.counters.video_bytes.load(Ordering::Relaxed),
            audio_bytes: self.counters.audio_bytes.load(Ordering::Relaxed),
            messages_produced: self.counters.messages.load(Ordering::Relaxed),
            queue_len: self.out.len(),
        }
    }

    /// Encode one raw frame and enqueue the resulting message.
    ///
    /// Returns false when the output queue is shut down.
    async fn process_one(
        encoder: &Encoder,
        pool: &FramePool,
        out: &Fifo<Message>,
        counters: &Counters,
        raw: crate::frame::MediaFrame,
        video: bool,
    ) -> bool {
        let mut encoded = pool.acquire();
        let ok = if video {
            encoder.encode_video(&raw, &mut encoded)
        } else {
            encoder.encode_audio(&raw, &mut encoded)
        };
        pool.release(raw);

        if !ok {
            // Encoder failure drops the frame; the encoder counted it
            pool.release(encoded);
            return true;
        }

        let msg_type = if video {
            MessageType::VideoFrame
        } else {
            MessageType::AudioFrame
        };
        let payload = Bytes::copy_from_slice(&encoded.payload);
        let len = payload.len() as u64;
        pool.release(encoded);

        let msg = Message::new(msg_type, payload, timestamp_now_ms());
        if out.push(msg).await.is_err() {
            return false;
        }

        if video {
            counters.video_frames.fetch_add(1, Ordering::Relaxed);
            counters.video_bytes.fetch_add(len, Ordering::Relaxed);
        } else {
            counters.audio_frames.fetch_add(1, Ordering::Relaxed);
            counters.audio_bytes.fetch_add(len, Ordering::Relaxed);
        }
        counters.messages.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioCaptureConfig, VideoCaptureConfig};
    use crate::encode::EncoderConfig;

    fn build() -> (Arc<VideoSource>, Arc<AudioSource>, Arc<Encoder>, Arc<FramePool>) {
        let pool = Arc::new(FramePool::new(16, 64 * 1024));
        let video = Arc::new(VideoSource::new(
            VideoCaptureConfig {
                bitrate: 240_000, // small frames: 1000 bytes at 30fps
                ..Default::default()
            },
            Arc::clone(&pool),
        ));
        let audio = Arc::new(AudioSource::new(
            AudioCaptureConfig::default(),
            Arc::clone(&pool),
        ));
        let encoder = Arc::new(Encoder::new(EncoderConfig::default()));
        encoder.start();
        (video, audio, encoder, pool)
    }

    #[tokio::test]
    async fn frames_become_messages_in_order() {
        let (video, audio, encoder, pool) = build();
        for n in 0..5 {
            video.produce_for_test(n);
        }

        let pipeline = PipelineProcessor::new(video, audio, encoder, pool, 64);
        let out = pipeline.output();
        pipeline.start();

        let mut timestamps = Vec::new();
        for _ in 0..5 {
            let msg = out
                .pop_for(Duration::from_secs(2))
                .await
                .expect("pipeline produced nothing");
            assert_eq!(msg.message_type(), Some(MessageType::VideoFrame));
            assert!(!msg.payload.is_empty());
            timestamps.push(msg.timestamp_ms());
        }
        // Stamped with current time, monotone within one run
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));

        let stats = pipeline.stats();
        assert_eq!(stats.video_frames, 5);
        assert_eq!(stats.messages_produced, 5);

        pipeline.stop().await;
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn producer_pauses_when_queue_full() {
        let (video, audio, encoder, pool) = build();
        for n in 0..20 {
            video.produce_for_test(n);
        }

        // Tiny output queue, nobody consuming
        let pipeline = PipelineProcessor::new(video, audio, encoder, pool, 4);
        let out = pipeline.output();
        pipeline.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(out.len(), 4, "queue should cap at its bound");

        // Draining lets the producer continue
        let msg = out.pop_for(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.message_type(), Some(MessageType::VideoFrame));

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stop_unblocks_a_full_queue_producer() {
        let (video, audio, encoder, pool) = build();
        for n in 0..20 {
            video.produce_for_test(n);
        }

        let pipeline = PipelineProcessor::new(video, audio, encoder, pool, 2);
        pipeline.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The producer is blocked pushing into the full queue; stop must
        // still return promptly.
        tokio::time::timeout(Duration::from_secs(1), pipeline.stop())
            .await
            .expect("stop hung on a blocked producer");
    }

    #[tokio::test]
    async fn pool_accounting_balances_after_run() {
        let (video, audio, encoder, pool) = build();
        for n in 0..8 {
            video.produce_for_test(n);
        }

        let pipeline = PipelineProcessor::new(
            video,
            audio,
            Arc::clone(&encoder),
            Arc::clone(&pool),
            64,
        );
        let out = pipeline.output();
        pipeline.start();

        for _ in 0..8 {
            out.pop_for(Duration::from_secs(2)).await.unwrap();
        }
        pipeline.stop().await;

        // Every produced frame was released back (acquire == release)
        let (acquired, released) = pool.counters();
        assert_eq!(acquired, released);
    }
}
