//! Fixed-capacity ring buffer holding the trailing window of PTY output,
//! replayed verbatim to a newly attached handler on reattach.

/// Default retained window: 100 KiB of raw PTY output.
pub const DEFAULT_CAPACITY: usize = 100 * 1024;

/// Ring buffer over a byte array of fixed `capacity`. `write` is
/// O(bytes.len()) and allocation-free (the backing array is allocated once,
/// at construction). Bytes are never interpreted; replay is byte-exact.
pub struct ScrollbackBuffer {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    len: usize,
}

impl ScrollbackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    /// Append bytes. If `bytes.len() >= capacity`, only the trailing
    /// `capacity` bytes are retained; otherwise the write wraps, evicting
    /// the oldest bytes as needed.
    pub fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() || self.capacity == 0 {
            return;
        }

        if bytes.len() >= self.capacity {
            let skip = bytes.len() - self.capacity;
            self.buf.copy_from_slice(&bytes[skip..]);
            self.write_pos = 0;
            self.len = self.capacity;
            return;
        }

        let n = bytes.len();
        let first_chunk = (self.capacity - self.write_pos).min(n);
        self.buf[self.write_pos..self.write_pos + first_chunk].copy_from_slice(&bytes[..first_chunk]);
        if first_chunk < n {
            let second_chunk = n - first_chunk;
            self.buf[..second_chunk].copy_from_slice(&bytes[first_chunk..]);
        }

        self.write_pos = (self.write_pos + n) % self.capacity;
        self.len = (self.len + n).min(self.capacity);
    }

    /// Return a contiguous copy of retained bytes, oldest to newest.
    pub fn read_all(&self) -> Vec<u8> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut result = Vec::with_capacity(self.len);
        if self.len < self.capacity {
            result.extend_from_slice(&self.buf[..self.len]);
        } else {
            result.extend_from_slice(&self.buf[self.write_pos..]);
            result.extend_from_slice(&self.buf[..self.write_pos]);
        }
        result
    }

    /// Reset to empty without shrinking the backing allocation.
    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.len = 0;
    }

    /// Current retained byte count, always `<= capacity`.
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ScrollbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_reads_empty() {
        let b = ScrollbackBuffer::new(16);
        assert_eq!(b.read_all(), Vec::<u8>::new());
        assert_eq!(b.size(), 0);
    }

    #[test]
    fn small_write_under_capacity() {
        let mut b = ScrollbackBuffer::new(16);
        b.write(b"hello");
        assert_eq!(b.read_all(), b"hello");
        assert_eq!(b.size(), 5);
    }

    #[test]
    fn wraps_at_capacity_keeps_trailing_bytes() {
        let mut b = ScrollbackBuffer::new(8);
        b.write(b"abcdefgh"); // exactly fills
        b.write(b"ij"); // wraps, evicts "ab"
        assert_eq!(b.read_all(), b"cdefghij");
        assert_eq!(b.size(), 8);
    }

    #[test]
    fn single_write_larger_than_capacity_keeps_only_trailing_capacity_bytes() {
        let mut b = ScrollbackBuffer::new(4);
        b.write(b"0123456789");
        assert_eq!(b.read_all(), b"6789");
    }

    #[test]
    fn multiple_wraps_preserve_order() {
        let mut b = ScrollbackBuffer::new(5);
        for chunk in [&b"ab"[..], &b"cde"[..], &b"fg"[..], &b"hij"[..]] {
            b.write(chunk);
        }
        // concatenation is "abcdefghij", trailing 5 bytes are "fghij"
        assert_eq!(b.read_all(), b"fghij");
    }

    #[test]
    fn single_byte_appends_accumulate_in_order() {
        let mut b = ScrollbackBuffer::new(4);
        for byte in b"abcdef" {
            b.write(&[*byte]);
        }
        assert_eq!(b.read_all(), b"cdef");
    }

    #[test]
    fn clear_resets_to_empty_and_capacity_is_unchanged() {
        let mut b = ScrollbackBuffer::new(8);
        b.write(b"abcdefgh");
        b.clear();
        assert_eq!(b.size(), 0);
        assert_eq!(b.read_all(), Vec::<u8>::new());
        b.write(b"xy");
        assert_eq!(b.read_all(), b"xy");
    }

    #[test]
    fn quantified_property_read_all_equals_trailing_capacity_of_concatenation() {
        let capacity = 6;
        let writes: [&[u8]; 5] = [b"a", b"bcd", b"ef", b"ghijk", b"lm"];
        let mut b = ScrollbackBuffer::new(capacity);
        let mut concat = Vec::new();
        for w in writes {
            b.write(w);
            concat.extend_from_slice(w);
        }
        let expected_len = capacity.min(concat.len());
        let expected = &concat[concat.len() - expected_len..];
        assert_eq!(b.read_all(), expected);
    }
}
