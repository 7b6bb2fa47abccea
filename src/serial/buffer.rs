use std::collections::VecDeque;

pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Bounded receive buffer for one connection.
///
/// Appends never fail: when a chunk would overflow `max_len`, the oldest
/// bytes are evicted so the buffer tail always holds the newest data.
#[derive(Debug, Clone)]
pub struct ByteRingBuffer {
    data: VecDeque<u8>,
    max_len: usize,
    total_appended: u64,
    total_evicted: u64,
}

impl ByteRingBuffer {
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            data: VecDeque::with_capacity(max_len.min(DEFAULT_BUFFER_CAPACITY)),
            max_len,
            total_appended: 0,
            total_evicted: 0,
        }
    }

    /// Append a chunk, returning how many old bytes were evicted
    pub fn append(&mut self, chunk: &[u8]) -> usize {
        self.total_appended += chunk.len() as u64;

        // Only the last max_len bytes of an oversized chunk can survive
        let chunk = if chunk.len() > self.max_len {
            let skipped = chunk.len() - self.max_len;
            self.total_evicted += skipped as u64;
            &chunk[skipped..]
        } else {
            chunk
        };

        let excess = (self.data.len() + chunk.len()).saturating_sub(self.max_len);
        self.data.drain(..excess);
        self.data.extend(chunk.iter().copied());
        self.total_evicted += excess as u64;

        excess
    }

    /// Owned copy in arrival order; callers iterate the copy, never the live buffer
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn total_appended(&self) -> u64 {
        self.total_appended
    }

    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }
}

impl Default for ByteRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_within_capacity() {
        let mut buf = ByteRingBuffer::new(8);
        assert_eq!(buf.append(b"abc"), 0);
        assert_eq!(buf.append(b"de"), 0);
        assert_eq!(buf.snapshot(), b"abcde");
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut buf = ByteRingBuffer::new(5);
        buf.append(b"abcd");
        assert_eq!(buf.append(b"efg"), 2);
        assert_eq!(buf.snapshot(), b"cdefg");
        assert_eq!(buf.total_evicted(), 2);
    }

    #[test]
    fn test_oversized_chunk_keeps_its_tail() {
        let mut buf = ByteRingBuffer::new(4);
        buf.append(b"xy");
        buf.append(b"0123456789");
        assert_eq!(buf.snapshot(), b"6789");
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.total_appended(), 12);
        assert_eq!(buf.total_evicted(), 8);
    }

    #[test]
    fn test_length_bound_holds_for_mixed_chunks() {
        let mut buf = ByteRingBuffer::new(7);
        let mut last = Vec::new();
        for size in [1usize, 3, 0, 9, 2, 7, 5, 13, 1] {
            let chunk: Vec<u8> = (0..size).map(|i| (i as u8).wrapping_add(size as u8)).collect();
            buf.append(&chunk);
            last.extend_from_slice(&chunk);
            assert!(buf.len() <= buf.max_len());
            let expected_start = last.len().saturating_sub(buf.max_len());
            assert_eq!(buf.snapshot(), &last[expected_start..]);
        }
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut buf = ByteRingBuffer::new(0);
        buf.append(b"ab");
        assert_eq!(buf.snapshot(), b"b");
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(ByteRingBuffer::default().max_len(), DEFAULT_BUFFER_CAPACITY);
    }
}
