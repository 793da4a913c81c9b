//! Wire protocol: 20-byte framed header plus payload
//!
//! Every message on the wire is a fixed header followed by a contiguous
//! payload. All header fields are little-endian:
//!
//! ```text
//! ┌───────────┬──────────┬──────────────┬──────────────┬──────────┐
//! │   magic   │   type   │ payload size │  timestamp   │   crc    │
//! │ (4 bytes) │ (2 bytes)│  (4 bytes)   │  (8 bytes)   │ (2 bytes)│
//! └───────────┴──────────┴──────────────┴──────────────┴──────────┘
//! ```
//!
//! The CRC-16 (polynomial 0xA001, initial value 0xFFFF) covers the first
//! 18 bytes of the serialized header, which fixes the layout independent
//! of in-memory struct representation.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Magic marking the start of a valid header.
pub const MAGIC: u32 = 0xABCD_1234;

/// Serialized header size in bytes.
pub const HEADER_LEN: usize = 20;

/// Maximum accepted payload size (100 MiB).
pub const MAX_PAYLOAD_LEN: u32 = 100 * 1024 * 1024;

/// Message type codes.
///
/// Data messages are 0-99, control messages 100-199, state messages
/// 200-299. The header carries the raw `u16`; unknown codes survive
/// decoding so dispatch can log and ignore them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    FrameData = 0,
    VideoFrame = 1,
    AudioFrame = 2,

    StartStream = 100,
    StopStream = 101,
    SetBitrate = 102,
    SetQuality = 103,
    CodecInfo = 104,

    Heartbeat = 200,
    HeartbeatAck = 201,
    Ack = 202,
    Error = 203,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            MessageType::FrameData => "FRAME_DATA",
            MessageType::VideoFrame => "VIDEO_FRAME",
            MessageType::AudioFrame => "AUDIO_FRAME",
            MessageType::StartStream => "START_STREAM",
            MessageType::StopStream => "STOP_STREAM",
            MessageType::SetBitrate => "SET_BITRATE",
            MessageType::SetQuality => "SET_QUALITY",
            MessageType::CodecInfo => "CODEC_INFO",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::HeartbeatAck => "HEARTBEAT_ACK",
            MessageType::Ack => "ACK",
            MessageType::Error => "ERROR",
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0 => Ok(MessageType::FrameData),
            1 => Ok(MessageType::VideoFrame),
            2 => Ok(MessageType::AudioFrame),
            100 => Ok(MessageType::StartStream),
            101 => Ok(MessageType::StopStream),
            102 => Ok(MessageType::SetBitrate),
            103 => Ok(MessageType::SetQuality),
            104 => Ok(MessageType::CodecInfo),
            200 => Ok(MessageType::Heartbeat),
            201 => Ok(MessageType::HeartbeatAck),
            202 => Ok(MessageType::Ack),
            203 => Ok(MessageType::Error),
            other => Err(other),
        }
    }
}

/// Error codes carried by `Error`-type messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    InvalidFormat = 1,
    CrcError = 2,
    SizeMismatch = 3,
    CodecNotSupported = 4,
    BufferOverflow = 5,
    Unknown = 255,
}

impl ErrorCode {
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::CrcError => "CRC_ERROR",
            ErrorCode::SizeMismatch => "SIZE_MISMATCH",
            ErrorCode::CodecNotSupported => "CODEC_NOT_SUPPORTED",
            ErrorCode::BufferOverflow => "BUFFER_OVERFLOW",
            ErrorCode::Unknown => "UNKNOWN_ERROR",
        }
    }
}

/// CRC-16 with polynomial 0xA001, initial value 0xFFFF, reflected
/// bit-by-bit update.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Fixed 20-byte message header.
///
/// `msg_type` stays a raw `u16`; validity only covers magic, payload
/// bound, and CRC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u16,
    pub payload_len: u32,
    pub timestamp_ms: u64,
    pub crc: u16,
}

impl MessageHeader {
    /// Build a header with the CRC already computed.
    pub fn new(msg_type: MessageType, payload_len: u32, timestamp_ms: u64) -> Self {
        let mut header = Self {
            msg_type: msg_type as u16,
            payload_len,
            timestamp_ms,
            crc: 0,
        };
        header.crc = header.compute_crc();
        header
    }

    /// CRC over the 18-byte serialized prefix (everything but the CRC).
    pub fn compute_crc(&self) -> u16 {
        let mut prefix = [0u8; HEADER_LEN - 2];
        self.write_prefix(&mut prefix);
        crc16(&prefix)
    }

    fn write_prefix(&self, out: &mut [u8; HEADER_LEN - 2]) {
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.msg_type.to_le_bytes());
        out[6..10].copy_from_slice(&self.payload_len.to_le_bytes());
        out[10..18].copy_from_slice(&self.timestamp_ms.to_le_bytes());
    }

    /// Serialize into `buf` (exactly [`HEADER_LEN`] bytes appended).
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let mut prefix = [0u8; HEADER_LEN - 2];
        self.write_prefix(&mut prefix);
        buf.put_slice(&prefix);
        buf.put_u16_le(self.crc);
    }

    /// Parse and validate a header from the first [`HEADER_LEN`] bytes.
    ///
    /// Checks run in order: magic, payload bound, CRC.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated {
                need: HEADER_LEN,
                have: buf.len(),
            });
        }

        let computed = crc16(&buf[..HEADER_LEN - 2]);

        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }

        let msg_type = buf.get_u16_le();
        let payload_len = buf.get_u32_le();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge { len: payload_len });
        }

        let timestamp_ms = buf.get_u64_le();
        let crc = buf.get_u16_le();
        if crc != computed {
            return Err(ProtocolError::CrcMismatch {
                computed,
                found: crc,
            });
        }

        Ok(Self {
            msg_type,
            payload_len,
            timestamp_ms,
            crc,
        })
    }

    /// Whether magic, payload bound, and CRC all hold.
    pub fn is_valid(&self) -> bool {
        self.payload_len <= MAX_PAYLOAD_LEN && self.crc == self.compute_crc()
    }

    /// The decoded message type, if the code is known.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::try_from(self.msg_type).ok()
    }
}

/// A complete protocol message: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Bytes,
}

impl Message {
    /// Build a message around `payload`.
    pub fn new(msg_type: MessageType, payload: Bytes, timestamp_ms: u64) -> Self {
        let header = MessageHeader::new(msg_type, payload.len() as u32, timestamp_ms);
        Self { header, payload }
    }

    /// Build a zero-payload message (heartbeats, acks, stream control).
    pub fn control(msg_type: MessageType, timestamp_ms: u64) -> Self {
        Self::new(msg_type, Bytes::new(), timestamp_ms)
    }

    /// Serialize header and payload contiguously.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a complete message from `buf`.
    ///
    /// Requires at least `HEADER_LEN + payload_len` bytes; trailing bytes
    /// are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let header = MessageHeader::decode(buf)?;
        let total = HEADER_LEN + header.payload_len as usize;
        if buf.len() < total {
            return Err(ProtocolError::Truncated {
                need: total,
                have: buf.len(),
            });
        }
        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..total]);
        Ok(Self { header, payload })
    }

    /// Total serialized size: header plus payload.
    pub fn total_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.header.message_type()
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.header.timestamp_ms
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_crc_is_deterministic() {
        let a = MessageHeader::new(MessageType::VideoFrame, 1024, 0);
        let b = MessageHeader::new(MessageType::VideoFrame, 1024, 0);
        assert_eq!(a.crc, b.crc);
        assert!(a.is_valid());

        // Corrupting the timestamp must change the CRC
        let c = MessageHeader::new(MessageType::VideoFrame, 1024, 1);
        assert_ne!(a.crc, c.crc);
    }

    #[test]
    fn heartbeat_round_trip() {
        let msg = Message::control(MessageType::Heartbeat, 42);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_LEN);

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.header.msg_type, 200);
        assert_eq!(decoded.header.payload_len, 0);
        assert_eq!(decoded.timestamp_ms(), 42);
        assert_eq!(decoded.message_type(), Some(MessageType::Heartbeat));
    }

    #[test]
    fn payload_round_trip() {
        let payload = Bytes::from((0..=255u8).collect::<Vec<_>>());
        let msg = Message::new(MessageType::VideoFrame, payload.clone(), 123_456_789);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), HEADER_LEN + 256);

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let msg = Message::control(MessageType::Ack, 7);
        let mut bytes = msg.encode().to_vec();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::BadMagic { .. })
        ));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        // Hand-build a header declaring an oversized payload, CRC intact
        let mut header = MessageHeader {
            msg_type: 1,
            payload_len: MAX_PAYLOAD_LEN + 1,
            timestamp_ms: 0,
            crc: 0,
        };
        header.crc = header.compute_crc();
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        assert!(matches!(
            MessageHeader::decode(&buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn single_bit_flips_are_rejected() {
        let msg = Message::new(MessageType::VideoFrame, Bytes::from_static(b"xyz"), 99);
        let reference = msg.encode();

        // Flip every bit of the CRC-protected prefix in turn
        for byte in 0..(HEADER_LEN - 2) {
            for bit in 0..8 {
                let mut corrupted = reference.to_vec();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    Message::decode(&corrupted).is_err(),
                    "flip at byte {byte} bit {bit} slipped through"
                );
            }
        }
    }

    #[test]
    fn corrupted_crc_field_is_rejected() {
        let msg = Message::control(MessageType::Heartbeat, 1);
        let mut bytes = msg.encode().to_vec();
        bytes[18] ^= 0x01;
        assert!(matches!(
            Message::decode(&bytes),
            Err(ProtocolError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let msg = Message::new(MessageType::AudioFrame, Bytes::from_static(b"pcm"), 5);
        let bytes = msg.encode();

        assert!(matches!(
            Message::decode(&bytes[..10]),
            Err(ProtocolError::Truncated { .. })
        ));
        assert!(matches!(
            Message::decode(&bytes[..HEADER_LEN + 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_type_code_still_decodes() {
        let mut header = MessageHeader {
            msg_type: 999,
            payload_len: 0,
            timestamp_ms: 0,
            crc: 0,
        };
        header.crc = header.compute_crc();
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);

        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded.msg_type, 999);
        assert_eq!(decoded.message_type(), None);
    }

    #[test]
    fn crc_reference_vector() {
        // CRC-16/MODBUS check value (poly 0xA001, init 0xFFFF)
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn type_codes_match_the_wire_values() {
        assert_eq!(MessageType::FrameData as u16, 0);
        assert_eq!(MessageType::VideoFrame as u16, 1);
        assert_eq!(MessageType::AudioFrame as u16, 2);
        assert_eq!(MessageType::StartStream as u16, 100);
        assert_eq!(MessageType::SetBitrate as u16, 102);
        assert_eq!(MessageType::Heartbeat as u16, 200);
        assert_eq!(MessageType::HeartbeatAck as u16, 201);
        assert_eq!(MessageType::Ack as u16, 202);
        assert_eq!(MessageType::Error as u16, 203);
        assert_eq!(MessageType::try_from(102), Ok(MessageType::SetBitrate));
        assert_eq!(MessageType::try_from(999), Err(999));
    }
}
