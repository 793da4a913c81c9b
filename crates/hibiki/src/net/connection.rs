//! Per-connection receive framing and send path
//!
//! Each accepted socket gets a [`Connection`]: a receive loop that frames
//! messages out of a byte ring, and a writer task draining a bounded send
//! queue. The send queue is what keeps fan-out non-blocking: a peer that
//! stops reading fills its own queue and drops its own messages without
//! ever stalling the distributor or other connections.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::protocol::{timestamp_now_ms, Message, MessageType, HEADER_LEN};
use crate::queue::{Fifo, TryPushError};
use crate::ring::RingBuffer;

/// Events delivered by the transport to its owner.
///
/// `on_connect` runs in the accept task, `on_message` in the connection's
/// receive task, `on_disconnect` after the receive loop exits.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn on_connect(&self, conn: &Arc<Connection>);
    async fn on_message(&self, conn: &Arc<Connection>, msg: Message);
    async fn on_disconnect(&self, conn: &Arc<Connection>);
}

/// Why an enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection's send queue is full; the message was dropped.
    QueueFull,
    /// The connection is closed.
    Closed,
}

/// Pulls complete protocol messages out of a byte ring.
///
/// Feeding and extraction are decoupled so the stream may arrive in
/// arbitrary chunks. A framing error clears the ring (resync policy) and
/// is reported to the caller for logging.
pub struct MessageExtractor {
    ring: RingBuffer,
}

impl MessageExtractor {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
        }
    }

    /// Buffer incoming bytes; returns how many were stored.
    pub fn feed(&self, bytes: &[u8]) -> usize {
        self.ring.write(bytes)
    }

    /// Try to extract the next complete message.
    ///
    /// `Ok(None)` means more bytes are needed. `Err` means the buffered
    /// data was invalid and has been discarded; extraction can resume
    /// with the next fed bytes.
    pub fn next_message(&self) -> Result<Option<Message>, ProtocolError> {
        if self.ring.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header_buf = [0u8; HEADER_LEN];
        self.ring.peek(&mut header_buf);

        let header = match crate::protocol::MessageHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                self.ring.clear();
                return Err(e);
            }
        };

        let total = HEADER_LEN + header.payload_len as usize;
        if total > self.ring.capacity() {
            // The declared message can never fit; drop everything rather
            // than wait forever
            self.ring.clear();
            return Err(ProtocolError::PayloadTooLarge {
                len: header.payload_len,
            });
        }
        if self.ring.len() < total {
            return Ok(None);
        }

        let mut data = vec![0u8; total];
        self.ring.read(&mut data);
        match Message::decode(&data) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => {
                self.ring.clear();
                Err(e)
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.ring.len()
    }
}

/// One accepted TCP peer.
pub struct Connection {
    id: u32,
    peer_addr: String,
    connected: AtomicBool,
    cancel: CancellationToken,

    reader: Mutex<Option<OwnedReadHalf>>,
    send_queue: Arc<Fifo<Message>>,
    extractor: MessageExtractor,

    last_activity: Mutex<Instant>,
    recv_timeout: Option<Duration>,

    bytes_sent: AtomicU64,
    messages_sent: AtomicU64,
    send_dropped: AtomicU64,
    framing_errors: AtomicU64,
}

impl Connection {
    /// Wrap an accepted stream and spawn its writer task.
    pub fn spawn(
        id: u32,
        stream: TcpStream,
        peer_addr: std::net::SocketAddr,
        ring_capacity: usize,
        send_queue_len: usize,
        send_timeout_ms: u64,
        recv_timeout_ms: u64,
    ) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new(Self {
            id,
            peer_addr: peer_addr.to_string(),
            connected: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            reader: Mutex::new(Some(read_half)),
            send_queue: Arc::new(Fifo::bounded(send_queue_len.max(1))),
            extractor: MessageExtractor::new(ring_capacity),
            last_activity: Mutex::new(Instant::now()),
            recv_timeout: (recv_timeout_ms > 0).then(|| Duration::from_millis(recv_timeout_ms)),
            bytes_sent: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            send_dropped: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
        });

        info!(conn = id, peer = %conn.peer_addr, "connection opened");

        let writer_conn = Arc::clone(&conn);
        let send_timeout = (send_timeout_ms > 0).then(|| Duration::from_millis(send_timeout_ms));
        tokio::spawn(async move {
            writer_conn.writer_loop(write_half, send_timeout).await;
        });

        conn
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a message for sending. Never blocks.
    pub fn enqueue(&self, msg: Message) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::Closed);
        }
        match self.send_queue.try_push(msg) {
            Ok(()) => Ok(()),
            Err(TryPushError::Full(_)) => {
                self.send_dropped.fetch_add(1, Ordering::Relaxed);
                Err(SendError::QueueFull)
            }
            Err(TryPushError::Shutdown(_)) => Err(SendError::Closed),
        }
    }

    /// Queue a zero-payload heartbeat stamped with the current time.
    pub fn send_heartbeat(&self) -> Result<(), SendError> {
        self.enqueue(Message::control(MessageType::Heartbeat, timestamp_now_ms()))
    }

    /// Queue a heartbeat acknowledgement.
    pub fn send_heartbeat_ack(&self) -> Result<(), SendError> {
        self.enqueue(Message::control(
            MessageType::HeartbeatAck,
            timestamp_now_ms(),
        ))
    }

    /// Close the connection. Idempotent.
    ///
    /// Flips `connected`, wakes the receive loop, and lets the writer
    /// drain what it already holds before exiting.
    pub fn close(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.send_queue.shutdown();
        self.cancel.cancel();
        info!(conn = self.id, peer = %self.peer_addr, "connection closed");
    }

    /// Instant of the last receive or successful send.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Whether the peer has been silent longer than `timeout`.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_activity().elapsed() > timeout
    }

    /// (bytes sent, messages sent, messages dropped on a full queue)
    pub fn send_counters(&self) -> (u64, u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.messages_sent.load(Ordering::Relaxed),
            self.send_dropped.load(Ordering::Relaxed),
        )
    }

    pub fn framing_errors(&self) -> u64 {
        self.framing_errors.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Receive loop: socket → ring → messages → handler.
    ///
    /// Runs as a worker-pool task; returns when the peer disconnects, the
    /// connection is closed, or a socket error occurs.
    pub async fn run_receive_loop(self: &Arc<Self>, handler: Arc<dyn ConnectionHandler>) {
        let mut reader = match self.reader.lock().unwrap().take() {
            Some(reader) => reader,
            None => return, // loop already ran once
        };

        let mut buf = [0u8; 4096];
        while self.is_connected() {
            let n = match self.read_some(&mut reader, &mut buf).await {
                ReadOutcome::Data(n) => n,
                ReadOutcome::TimedOut => continue,
                ReadOutcome::Closed => break,
            };

            self.touch();
            let written = self.extractor.feed(&buf[..n]);
            if written < n {
                warn!(
                    conn = self.id,
                    dropped = n - written,
                    "receive ring full, bytes dropped"
                );
            }

            loop {
                match self.extractor.next_message() {
                    Ok(Some(msg)) => {
                        debug!(
                            conn = self.id,
                            msg_type = msg.header.msg_type,
                            len = msg.total_len(),
                            "message received"
                        );
                        handler.on_message(self, msg).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.framing_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(conn = self.id, error = %e, "framing error, buffer cleared");
                        break;
                    }
                }
            }
        }

        self.close();
        debug!(conn = self.id, "receive loop finished");
    }

    async fn read_some(&self, reader: &mut OwnedReadHalf, buf: &mut [u8]) -> ReadOutcome {
        let read = async {
            match self.recv_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, reader.read(buf)).await {
                    Ok(res) => ReadResult::Io(res),
                    Err(_) => ReadResult::TimedOut,
                },
                None => ReadResult::Io(reader.read(buf).await),
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => ReadOutcome::Closed,
            result = read => match result {
                ReadResult::TimedOut => ReadOutcome::TimedOut,
                ReadResult::Io(Ok(0)) => {
                    debug!(conn = self.id, "peer closed the stream");
                    ReadOutcome::Closed
                }
                ReadResult::Io(Ok(n)) => ReadOutcome::Data(n),
                ReadResult::Io(Err(e)) => {
                    debug!(conn = self.id, error = %e, "socket read error");
                    ReadOutcome::Closed
                }
            },
        }
    }

    async fn writer_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        send_timeout: Option<Duration>,
    ) {
        while let Some(msg) = self.send_queue.pop().await {
            let bytes = msg.encode();
            let write = async { writer.write_all(&bytes).await };

            let result = match send_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, write).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(conn = self.id, "send timed out");
                        break;
                    }
                },
                None => write.await,
            };

            if let Err(e) = result {
                debug!(conn = self.id, error = %e, "socket write error");
                break;
            }

            self.touch();
            self.bytes_sent
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        }

        self.close();
        let _ = writer.shutdown().await;
        debug!(conn = self.id, "writer finished");
    }
}

enum ReadResult {
    Io(std::io::Result<usize>),
    TimedOut,
}

enum ReadOutcome {
    Data(usize),
    TimedOut,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn video_msg(payload: &[u8], timestamp: u64) -> Message {
        Message::new(
            MessageType::VideoFrame,
            Bytes::copy_from_slice(payload),
            timestamp,
        )
    }

    #[test]
    fn extracts_single_message() {
        let extractor = MessageExtractor::new(4096);
        let msg = video_msg(b"payload", 12);
        extractor.feed(&msg.encode());

        let got = extractor.next_message().unwrap().unwrap();
        assert_eq!(got, msg);
        assert!(extractor.next_message().unwrap().is_none());
    }

    #[test]
    fn two_chunk_delivery() {
        let extractor = MessageExtractor::new(4096);
        let msg = video_msg(&[7u8; 100], 5);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 120);

        // First 16 bytes: not even a full header
        extractor.feed(&bytes[..16]);
        assert!(extractor.next_message().unwrap().is_none());

        // The rest completes exactly one message
        extractor.feed(&bytes[16..]);
        let got = extractor.next_message().unwrap().unwrap();
        assert_eq!(got.payload.len(), 100);
        assert_eq!(got.payload, msg.payload);
        assert!(extractor.next_message().unwrap().is_none());
    }

    #[test]
    fn one_byte_chunks_yield_all_messages_in_order() {
        let extractor = MessageExtractor::new(4096);
        let messages: Vec<Message> = (0..5)
            .map(|i| video_msg(format!("frame-{i}").as_bytes(), i as u64))
            .collect();

        let mut stream = Vec::new();
        for msg in &messages {
            stream.extend_from_slice(&msg.encode());
        }

        let mut extracted = Vec::new();
        for byte in stream {
            extractor.feed(&[byte]);
            while let Ok(Some(msg)) = extractor.next_message() {
                extracted.push(msg);
            }
        }
        assert_eq!(extracted, messages);
    }

    #[test]
    fn garbage_prefix_resyncs_via_clear() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);

        let extractor = MessageExtractor::new(4096);
        let mut garbage = [0u8; 64];
        rng.fill(&mut garbage[..]);
        // Make sure the garbage cannot start with the real magic
        garbage[0] = 0xFF;

        extractor.feed(&garbage);
        assert!(extractor.next_message().is_err());
        assert_eq!(extractor.buffered(), 0, "clear drops all buffered bytes");

        // Valid traffic after the clear extracts normally
        let msg = video_msg(b"after-resync", 9);
        extractor.feed(&msg.encode());
        assert_eq!(extractor.next_message().unwrap().unwrap(), msg);
    }

    #[test]
    fn corrupt_header_clears_buffered_tail() {
        let extractor = MessageExtractor::new(4096);
        let first = video_msg(b"aaaa", 1);
        let second = video_msg(b"bbbb", 2);

        let mut bytes = first.encode().to_vec();
        bytes[4] ^= 0xFF; // corrupt the type field; CRC now fails
        extractor.feed(&bytes);
        extractor.feed(&second.encode());

        // First extraction hits the bad header and clears everything,
        // including the (valid) second message
        assert!(extractor.next_message().is_err());
        assert!(extractor.next_message().unwrap().is_none());

        // The stream recovers with the next message fed
        let third = video_msg(b"cccc", 3);
        extractor.feed(&third.encode());
        assert_eq!(extractor.next_message().unwrap().unwrap(), third);
    }

    #[test]
    fn message_larger_than_ring_is_rejected() {
        let extractor = MessageExtractor::new(64);
        let msg = video_msg(&[1u8; 100], 1); // 120 bytes > 64
        let bytes = msg.encode();
        extractor.feed(&bytes[..40]);

        assert!(matches!(
            extractor.next_message(),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
