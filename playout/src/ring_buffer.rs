//! Fixed-capacity circular buffer for PCM samples
//!
//! Backs a playback session with `capacity * element_size` bytes of storage,
//! where an element is one mono sample of 1, 2, 3, or 4 bytes. The buffer is
//! a pure data structure with no interior locking: the owning session guards
//! every access with its own mutex (the producer thread writes, the backend
//! callback thread reads).
//!
//! ## Design
//!
//! `count` is the single source of truth for fullness. `read_index` and
//! `write_index` are element positions advancing `(index + n) % capacity`.
//! Wrap-around is handled by splitting an access into at most two contiguous
//! copies instead of per-element modulo arithmetic.
//!
//! A short `read` is not an error: the callback requesting more elements than
//! are buffered is ordinary starvation, and the unfilled remainder of its
//! output slot stays at silence.

use crate::error::{Error, Result};
use tracing::debug;

/// Circular byte buffer holding fixed-size sample elements.
pub struct RingBuffer {
    data: Vec<u8>,
    /// Bytes per element, fixed at creation (1..=4)
    element_size: usize,
    /// Maximum element count, fixed at creation
    capacity: usize,
    /// Valid elements currently buffered, `0 <= count <= capacity`
    count: usize,
    /// Next element position to read, in elements
    read_index: usize,
    /// Next element position to write, in elements
    write_index: usize,
}

impl RingBuffer {
    /// Allocate a buffer for `capacity` elements of `element_size` bytes.
    ///
    /// Allocation is fallible and reports `OutOfMemory` instead of aborting.
    /// `capacity > 0` and `element_size` in 1..=4 are the caller's
    /// preconditions; session init validates both before getting here.
    pub fn new(capacity: usize, element_size: usize) -> Result<Self> {
        debug_assert!(capacity > 0, "ring buffer capacity must be positive");
        debug_assert!(
            (1..=4).contains(&element_size),
            "element size must be 1..=4 bytes"
        );

        let bytes = capacity * element_size;
        let mut data = Vec::new();
        data.try_reserve_exact(bytes).map_err(|e| {
            Error::OutOfMemory(format!(
                "Failed to allocate {} byte ring buffer: {}",
                bytes, e
            ))
        })?;
        data.resize(bytes, 0);

        debug!(
            "Created ring buffer: capacity={} elements, element_size={} bytes",
            capacity, element_size
        );

        Ok(Self {
            data,
            element_size,
            capacity,
            count: 0,
            read_index: 0,
            write_index: 0,
        })
    }

    /// Maximum element count.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes per element.
    pub fn element_size(&self) -> usize {
        self.element_size
    }

    /// Elements currently buffered.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Free space in elements: `capacity - count`.
    pub fn available(&self) -> usize {
        self.capacity - self.count
    }

    /// True when no elements are buffered.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Copy whole elements from `src` into the buffer.
    ///
    /// Writes `min(src.len() / element_size, available())` elements starting
    /// at `write_index`, wrapping via at most two contiguous copies, and
    /// returns how many were written. Callers clamp to `available()` before
    /// calling, so a full buffer yields 0 rather than an error. Trailing
    /// bytes of `src` that do not form a whole element are ignored.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let n = (src.len() / self.element_size).min(self.available());
        if n == 0 {
            return 0;
        }

        let es = self.element_size;
        let first = n.min(self.capacity - self.write_index);
        let second = n - first;

        let start = self.write_index * es;
        self.data[start..start + first * es].copy_from_slice(&src[..first * es]);
        if second > 0 {
            self.data[..second * es].copy_from_slice(&src[first * es..n * es]);
        }

        self.write_index = (self.write_index + n) % self.capacity;
        self.count += n;
        n
    }

    /// Copy buffered elements out into `dst`.
    ///
    /// Reads `min(dst.len() / element_size, count)` elements starting at
    /// `read_index`, wrapping as needed, and returns the actual number read.
    /// A short read (including 0) signals starvation to the caller and is
    /// never an error.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = (dst.len() / self.element_size).min(self.count);
        if n == 0 {
            return 0;
        }

        let es = self.element_size;
        let first = n.min(self.capacity - self.read_index);
        let second = n - first;

        let start = self.read_index * es;
        dst[..first * es].copy_from_slice(&self.data[start..start + first * es]);
        if second > 0 {
            dst[first * es..n * es].copy_from_slice(&self.data[..second * es]);
        }

        self.read_index = (self.read_index + n) % self.capacity;
        self.count -= n;
        n
    }

    /// Return to the empty state without reallocating.
    ///
    /// Clears `count` and rewinds both indices; buffered bytes are simply
    /// forgotten. Called on session stop.
    pub fn reset(&mut self) {
        self.count = 0;
        self.read_index = 0;
        self.write_index = 0;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("element_size", &self.element_size)
            .field("count", &self.count)
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_starts_empty() {
        let buffer = RingBuffer::new(64, 2).unwrap();

        assert_eq!(buffer.capacity(), 64);
        assert_eq!(buffer.element_size(), 2);
        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.available(), 64);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_write_read_fifo_order() {
        let mut buffer = RingBuffer::new(8, 2).unwrap();

        let written = buffer.write(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(written, 3);
        assert_eq!(buffer.count(), 3);

        let mut out = [0u8; 6];
        let read = buffer.read(&mut out);
        assert_eq!(read, 3);
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_capacity_invariant() {
        let mut buffer = RingBuffer::new(16, 1).unwrap();

        // available() + count() == capacity() through arbitrary interleaving
        let mut scratch = [0u8; 8];
        for step in 0..50 {
            if step % 3 == 0 {
                buffer.read(&mut scratch[..step % 7 + 1]);
            } else {
                buffer.write(&[0xAB; 5][..step % 5 + 1]);
            }
            assert_eq!(buffer.available() + buffer.count(), buffer.capacity());
            assert!(buffer.count() <= buffer.capacity());
        }
    }

    #[test]
    fn test_write_clamps_to_available() {
        let mut buffer = RingBuffer::new(4, 2).unwrap();

        // 6 elements offered, 4 fit
        let data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        assert_eq!(buffer.write(&data), 4);
        assert_eq!(buffer.count(), 4);
        assert_eq!(buffer.available(), 0);

        // Full buffer accepts nothing
        assert_eq!(buffer.write(&data), 0);
        assert_eq!(buffer.count(), 4);

        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_read_clamps_to_count() {
        let mut buffer = RingBuffer::new(8, 2).unwrap();
        buffer.write(&[9, 9, 8, 8]);

        // Ask for 4 elements, only 2 buffered
        let mut out = [0u8; 8];
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(&out[..4], &[9, 9, 8, 8]);

        // Empty read is starvation, not an error
        assert_eq!(buffer.read(&mut out), 0);
    }

    #[test]
    fn test_partial_trailing_bytes_ignored() {
        let mut buffer = RingBuffer::new(8, 2).unwrap();

        // 5 bytes at element_size 2 -> 2 whole elements
        assert_eq!(buffer.write(&[1, 2, 3, 4, 5]), 2);
        assert_eq!(buffer.count(), 2);

        // 3-byte destination at element_size 2 -> 1 whole element out
        let mut out = [0u8; 3];
        assert_eq!(buffer.read(&mut out), 1);
        assert_eq!(&out[..2], &[1, 2]);
    }

    #[test]
    fn test_wraparound_roundtrip_all_offsets() {
        // Shift the cursors to every position and verify a wrapping
        // write/read pair survives intact
        for offset in 0..8 {
            let mut buffer = RingBuffer::new(8, 2).unwrap();
            let mut scratch = [0u8; 2];
            for _ in 0..offset {
                buffer.write(&[0, 0]);
                buffer.read(&mut scratch);
            }

            let data: Vec<u8> = (0u8..12).collect();
            assert_eq!(buffer.write(&data), 6);

            let mut out = [0u8; 12];
            assert_eq!(buffer.read(&mut out), 6);
            assert_eq!(&out[..], &data[..]);
        }
    }

    #[test]
    fn test_wrapping_write_splits_at_boundary() {
        let mut buffer = RingBuffer::new(4, 1).unwrap();
        let mut scratch = [0u8; 4];

        // Move write_index to 3
        buffer.write(&[0, 0, 0]);
        buffer.read(&mut scratch[..3]);

        // 3 elements from index 3 wraps: 1 at the tail, 2 at the head
        assert_eq!(buffer.write(&[7, 8, 9]), 3);
        assert_eq!(buffer.count(), 3);

        let mut out = [0u8; 3];
        assert_eq!(buffer.read(&mut out), 3);
        assert_eq!(out, [7, 8, 9]);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut buffer = RingBuffer::new(8, 2).unwrap();
        buffer.write(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(buffer.count(), 3);

        buffer.reset();

        assert_eq!(buffer.count(), 0);
        assert_eq!(buffer.available(), 8);
        assert!(buffer.is_empty());

        // Indices rewound: fresh data reads back from the start
        buffer.write(&[10, 11]);
        let mut out = [0u8; 2];
        assert_eq!(buffer.read(&mut out), 1);
        assert_eq!(out, [10, 11]);
    }

    #[test]
    fn test_all_element_sizes_roundtrip() {
        for es in 1..=4usize {
            let mut buffer = RingBuffer::new(6, es).unwrap();
            let data: Vec<u8> = (0..(6 * es) as u8).collect();

            assert_eq!(buffer.write(&data), 6);
            assert_eq!(buffer.available(), 0);

            let mut out = vec![0u8; 6 * es];
            assert_eq!(buffer.read(&mut out), 6);
            assert_eq!(out, data, "element_size {} roundtrip", es);
        }
    }

    #[test]
    fn test_interleaved_stream_preserves_order() {
        // Producer/consumer interleaving with a buffer much smaller than the
        // stream; everything read must come back in stream order
        let mut buffer = RingBuffer::new(5, 2).unwrap();
        let stream: Vec<u8> = (0..200u8).collect();

        let mut fed = 0;
        let mut collected = Vec::new();
        let mut out = [0u8; 6];
        while collected.len() < stream.len() {
            if fed < stream.len() {
                let wrote = buffer.write(&stream[fed..(fed + 8).min(stream.len())]);
                fed += wrote * 2;
            }
            let read = buffer.read(&mut out);
            collected.extend_from_slice(&out[..read * 2]);
        }

        assert_eq!(collected, stream);
    }
}
