//! Hibiki: multi-client A/V streaming server
//!
//! A four-stage streaming pipeline behind a length-prefixed binary wire
//! protocol:
//!
//! - **Capture** produces raw frames (synthetic test pattern in this
//!   build; real devices are an adapter boundary)
//! - **Encode** transforms frames at a configurable quality tier
//! - **Pipeline** wraps coded frames into protocol messages on a bounded
//!   queue
//! - **Distribute** fans messages out to every subscribed TCP peer, with
//!   per-connection send queues so one slow peer never stalls the rest
//!
//! [`AvServer`] wires the stages together; the `hibiki-server` binary
//! wraps it in a CLI.

pub mod capture;
pub mod codec;
pub mod config;
pub mod distribute;
pub mod encode;
pub mod error;
pub mod frame;
pub mod net;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod ring;
pub mod server;
pub mod stats;
pub mod workers;

pub use capture::{AudioCaptureConfig, AudioSource, SourceKind, VideoCaptureConfig, VideoSource};
pub use codec::{AudioCodec, VideoCodec};
pub use config::ServerConfig;
pub use distribute::{BitratePolicy, Distributor, SubscriberRegistry, SubscriberSession};
pub use encode::{Encoder, EncoderConfig, QualityTier};
pub use error::{ProtocolError, ServerError};
pub use frame::{Codec, FrameKind, FramePool, MediaFrame};
pub use net::{Connection, ConnectionHandler, MessageExtractor, SendError, TcpEndpoint};
pub use pipeline::PipelineProcessor;
pub use protocol::{
    crc16, timestamp_now_ms, ErrorCode, Message, MessageHeader, MessageType, HEADER_LEN,
    MAGIC, MAX_PAYLOAD_LEN,
};
pub use queue::{Fifo, TryPushError};
pub use ring::RingBuffer;
pub use server::AvServer;
pub use stats::{ServerStats, StatsSnapshot};
pub use workers::WorkerPool;
