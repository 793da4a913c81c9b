//! Fixed-capacity byte ring buffer
//!
//! Backs the per-connection receive path: socket reads land here and the
//! message extractor peeks/reads framed messages back out. Reads and
//! writes wrap around the end of the storage in at most two copies.

use std::sync::Mutex;

struct RingInner {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    fill: usize,
}

/// Circular byte store with wrap-around reads and writes.
///
/// All operations are O(1) in allocations and take a short internal lock,
/// so a reader and writer may share one instance. The lock is never held
/// across I/O.
pub struct RingBuffer {
    inner: Mutex<RingInner>,
    capacity: usize,
}

impl RingBuffer {
    /// Create a ring with the given fixed capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            inner: Mutex::new(RingInner {
                buf: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                fill: 0,
            }),
            capacity,
        }
    }

    /// Write up to `src.len()` bytes, returning how many were stored.
    ///
    /// Never overwrites unread data: when free space runs out only the
    /// leading portion of `src` is written.
    pub fn write(&self, src: &[u8]) -> usize {
        if src.is_empty() {
            return 0;
        }

        let mut inner = self.inner.lock().unwrap();
        let n = src.len().min(self.capacity - inner.fill);
        if n == 0 {
            return 0;
        }

        let first = n.min(self.capacity - inner.write_pos);
        let write_pos = inner.write_pos;
        inner.buf[write_pos..write_pos + first].copy_from_slice(&src[..first]);
        if n > first {
            inner.buf[..n - first].copy_from_slice(&src[first..n]);
        }

        inner.write_pos = (inner.write_pos + n) % self.capacity;
        inner.fill += n;
        n
    }

    /// Read up to `dst.len()` bytes, advancing the read position.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let n = Self::copy_out(&inner, dst, self.capacity);
        inner.read_pos = (inner.read_pos + n) % self.capacity;
        inner.fill -= n;
        n
    }

    /// Read up to `dst.len()` bytes without advancing the read position.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let inner = self.inner.lock().unwrap();
        Self::copy_out(&inner, dst, self.capacity)
    }

    /// Discard all buffered bytes and reset both positions.
    ///
    /// This is the resync action after a framing error.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_pos = 0;
        inner.write_pos = 0;
        inner.fill = 0;
    }

    /// Number of buffered (unread) bytes.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().fill
    }

    /// Number of bytes that can be written before the ring is full.
    pub fn free(&self) -> usize {
        self.capacity - self.inner.lock().unwrap().fill
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    fn copy_out(inner: &RingInner, dst: &mut [u8], capacity: usize) -> usize {
        let n = dst.len().min(inner.fill);
        if n == 0 {
            return 0;
        }
        let first = n.min(capacity - inner.read_pos);
        dst[..first].copy_from_slice(&inner.buf[inner.read_pos..inner.read_pos + first]);
        if n > first {
            dst[first..n].copy_from_slice(&inner.buf[..n - first]);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let ring = RingBuffer::new(64);
        assert_eq!(ring.write(b"hello world"), 11);
        assert_eq!(ring.len(), 11);

        let mut out = [0u8; 11];
        assert_eq!(ring.read(&mut out), 11);
        assert_eq!(&out, b"hello world");
        assert!(ring.is_empty());
    }

    #[test]
    fn peek_does_not_advance() {
        let ring = RingBuffer::new(16);
        ring.write(b"abcd");

        let mut out = [0u8; 4];
        assert_eq!(ring.peek(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(ring.len(), 4);

        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert!(ring.is_empty());
    }

    #[test]
    fn partial_write_when_full() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.write(b"12345"), 5);
        // Only 3 bytes of space remain
        assert_eq!(ring.write(b"67890"), 3);
        assert!(ring.is_full());
        assert_eq!(ring.write(b"x"), 0);

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(&out, b"12345678");
    }

    #[test]
    fn wrap_around_write_and_read() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcdef");
        let mut out = [0u8; 4];
        ring.read(&mut out); // read_pos = 4, fill = 2

        // 6 bytes: 4 fit at the tail, 2 wrap to the front
        assert_eq!(ring.write(b"ghijkl"), 6);
        assert_eq!(ring.len(), 8);

        let mut all = [0u8; 8];
        assert_eq!(ring.read(&mut all), 8);
        assert_eq!(&all, b"efghijkl");
    }

    #[test]
    fn clear_resets_everything() {
        let ring = RingBuffer::new(8);
        ring.write(b"abcdef");
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.free(), 8);

        ring.write(b"xy");
        let mut out = [0u8; 2];
        ring.read(&mut out);
        assert_eq!(&out, b"xy");
    }

    #[test]
    fn fill_plus_free_is_capacity_across_random_ops() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let ring = RingBuffer::new(97);
        let mut scratch = [0u8; 64];

        for _ in 0..10_000 {
            match rng.gen_range(0..3) {
                0 => {
                    let n = rng.gen_range(0..scratch.len());
                    ring.write(&scratch[..n]);
                }
                1 => {
                    let n = rng.gen_range(0..scratch.len());
                    ring.read(&mut scratch[..n]);
                }
                _ => {
                    let n = rng.gen_range(0..scratch.len());
                    ring.peek(&mut scratch[..n]);
                }
            }
            assert_eq!(ring.len() + ring.free(), ring.capacity());
        }
    }

    #[test]
    fn data_integrity_across_many_wraps() {
        let ring = RingBuffer::new(13);
        let mut expected: u8 = 0;
        let mut next: u8 = 0;

        for _ in 0..1000 {
            let chunk: Vec<u8> = (0..5)
                .map(|_| {
                    let v = next;
                    next = next.wrapping_add(1);
                    v
                })
                .collect();
            let written = ring.write(&chunk);
            // Roll back the generator for bytes that did not fit
            next = next.wrapping_sub((chunk.len() - written) as u8);

            let mut out = [0u8; 5];
            let read = ring.read(&mut out);
            for &b in &out[..read] {
                assert_eq!(b, expected);
                expected = expected.wrapping_add(1);
            }
        }
    }
}
