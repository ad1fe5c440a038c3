use std::io::{self, IoSliceMut, Read};
use std::net::TcpStream;

/// Reserved space in front of the readable region, so short headers can be
/// prepended without sliding the payload.
pub const CHEAP_PREPEND: usize = 8;

/// Initial capacity of the readable/writable region.
pub const INITIAL_SIZE: usize = 1024;

/// Stack spill buffer used by [`Buffer::read_fd`]; a single vectored read can
/// drain up to this much beyond the writable tail.
const EXTRA_BUF_SIZE: usize = 65536;

/// Growable byte accumulator with cheap-prepend space.
///
/// Layout invariant: `read_idx <= write_idx <= buf.len()`; the readable region
/// is `[read_idx, write_idx)`, the prependable region is `[0, read_idx)`.
/// Grows by sliding readable bytes back to the front when the combined free
/// space suffices, reallocating larger otherwise. Never shrinks.
pub struct Buffer {
    buf: Vec<u8>,
    read_idx: usize,
    write_idx: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::with_capacity(INITIAL_SIZE)
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn with_capacity(size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + size],
            read_idx: CHEAP_PREPEND,
            write_idx: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_idx - self.read_idx
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_idx
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_idx
    }

    /// The readable region, without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_idx..self.write_idx]
    }

    /// Consumes `len` readable bytes; consuming everything resets the buffer
    /// to its empty, fully-prependable state.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_idx += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_idx = CHEAP_PREPEND;
        self.write_idx = CHEAP_PREPEND;
    }

    /// Consumes and returns up to `len` readable bytes.
    pub fn retrieve_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let data = self.peek()[..len].to_vec();
        self.retrieve(len);
        data
    }

    pub fn retrieve_all_bytes(&mut self) -> Vec<u8> {
        self.retrieve_bytes(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        if self.writable_bytes() < data.len() {
            self.make_space(data.len());
        }
        self.buf[self.write_idx..self.write_idx + data.len()].copy_from_slice(data);
        self.write_idx += data.len();
    }

    /// Writes `data` directly in front of the readable region.
    ///
    /// Panics if the prependable space is insufficient; the cheap-prepend
    /// reserve bounds what callers may put here.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes(), "prepend space exhausted");
        self.read_idx -= data.len();
        self.buf[self.read_idx..self.read_idx + data.len()].copy_from_slice(data);
    }

    /// Drains the socket with a single vectored read into the writable tail
    /// plus a stack spill buffer, so one syscall suffices no matter how little
    /// writable space is left. Returns the number of bytes read; zero means
    /// the peer closed its write side.
    pub fn read_fd(&mut self, stream: &TcpStream) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let mut iovs = [
                IoSliceMut::new(&mut self.buf[self.write_idx..]),
                IoSliceMut::new(&mut extra),
            ];
            let iov_cnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
            let mut sock = stream;
            sock.read_vectored(&mut iovs[..iov_cnt])?
        };
        if n <= writable {
            self.write_idx += n;
        } else {
            self.write_idx = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_idx + len, 0);
        } else {
            // enough total slack: slide readable bytes back to the front
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_idx..self.write_idx, CHEAP_PREPEND);
            self.read_idx = CHEAP_PREPEND;
            self.write_idx = self.read_idx + readable;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn append_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.retrieve_bytes(5), b"hello");
        assert_eq!(buf.peek(), b" world");
        assert_eq!(buf.retrieve_all_bytes(), b" world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn full_retrieve_resets_to_prependable_state() {
        let mut buf = Buffer::new();
        buf.append(&[0xAA; 100]);
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    }

    #[test]
    fn retrieve_more_than_readable_clamps() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(64);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows_beyond_initial_size() {
        let mut buf = Buffer::new();
        let data = vec![b'x'; INITIAL_SIZE * 3];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), data.len());
        assert_eq!(buf.peek(), &data[..]);
    }

    #[test]
    fn slides_readable_bytes_instead_of_growing() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.retrieve(600);
        // 200 readable left; 600 + 8 prependable + 224 writable is enough
        buf.append(&vec![b'b'; 600]);
        assert_eq!(buf.readable_bytes(), 800);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(&buf.peek()[..200], &vec![b'a'; 200][..]);
        assert_eq!(&buf.peek()[200..], &vec![b'b'; 600][..]);
    }

    #[test]
    fn prepend_uses_reserved_space() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend(&7u32.to_be_bytes());
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }
}
