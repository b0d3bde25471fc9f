//! A contiguous byte window with separate read and write cursors.
//!
//! Committed data lives in `buf[start..end]`; `buf[end..]` is spare room for
//! the next read. The window compacts when it empties and grows geometrically
//! when a reservation cannot fit, so it converges on the largest packet the
//! connection actually carries.

pub struct ByteStream {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    initial_size: usize,
}

impl ByteStream {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity {} must be > 0", capacity);
        Self { buf: vec![0; capacity], start: 0, end: 0, initial_size: capacity }
    }

    /// Committed, not-yet-consumed bytes.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    #[inline(always)]
    pub fn data_size(&self) -> usize {
        self.end - self.start
    }

    /// Spare room for the next read. Never empty after [Self::reserve].
    #[inline(always)]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.end..]
    }

    #[inline(always)]
    pub fn spare_size(&self) -> usize {
        self.buf.len() - self.end
    }

    /// Makes room for at least `n` more bytes, compacting before growing.
    pub fn reserve(&mut self, n: usize) {
        if self.spare_size() >= n {
            return;
        }
        let data_size = self.data_size();
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.start = 0;
            self.end = data_size;
        }
        if self.spare_size() < n {
            let mut new_size = self.buf.len().max(1);
            while new_size - data_size < n {
                new_size *= 2;
            }
            self.buf.resize(new_size, 0);
        }
    }

    /// Marks `n` freshly-read bytes as data.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.spare_size());
        self.end += n;
    }

    /// Consumes `n` bytes from the front.
    #[inline]
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.data_size());
        self.start += n;
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.reserve(bytes.len());
        self.buf[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
    }

    /// Takes back the last `n` written bytes.
    #[inline]
    pub fn unwrite(&mut self, n: usize) {
        debug_assert!(n <= self.data_size());
        self.end -= n;
    }

    /// Releases grown storage back to the initial footprint.
    pub fn gc(&mut self) {
        self.start = 0;
        self.end = 0;
        if self.buf.len() > self.initial_size {
            self.buf = vec![0; self.initial_size];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_and_skip() {
        let mut bs = ByteStream::with_capacity(8);
        bs.spare_mut()[..4].copy_from_slice(b"abcd");
        bs.commit(4);
        assert_eq!(bs.data(), b"abcd");
        bs.skip(2);
        assert_eq!(bs.data(), b"cd");
        bs.skip(2);
        assert_eq!(bs.data_size(), 0);
        // cursors rewind when emptied
        assert_eq!(bs.spare_size(), 8);
    }

    #[test]
    fn test_reserve_compacts_then_grows() {
        let mut bs = ByteStream::with_capacity(8);
        bs.write_bytes(b"12345678");
        bs.skip(6);
        bs.reserve(6);
        assert_eq!(bs.data(), b"78");
        assert!(bs.spare_size() >= 6);

        bs.reserve(100);
        assert_eq!(bs.data(), b"78");
        assert!(bs.spare_size() >= 100);
    }

    #[test]
    fn test_unwrite_rolls_back() {
        let mut bs = ByteStream::with_capacity(16);
        bs.write_bytes(b"keep");
        bs.write_bytes(b"drop");
        bs.unwrite(4);
        assert_eq!(bs.data(), b"keep");
    }

    #[test]
    fn test_gc_releases_growth() {
        let mut bs = ByteStream::with_capacity(8);
        bs.write_bytes(&[0u8; 1024]);
        bs.gc();
        assert_eq!(bs.data_size(), 0);
        assert_eq!(bs.spare_size(), 8);
    }
}
