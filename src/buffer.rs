//! Byte buffer backing the per-connection read and write queues.
//!
//! The region is split by two cursors into three spans: prependable
//! `[0..read)`, readable `[read..write)` and writable `[write..capacity)`.
//! Space freed at the head is reclaimed by compaction before the buffer ever
//! grows, which keeps steady-state keep-alive traffic allocation-free.

use std::io::{IoSliceMut, Read, Result, Write};

const INITIAL_CAPACITY: usize = 1024;

/// Size of the stack-allocated overflow region used by [`Buffer::read_from`].
/// A single scatter-read syscall can always drain this many bytes beyond the
/// writable span, whatever the buffer's current capacity.
const OVERFLOW_LEN: usize = 65536;

/// Growable byte region with prependable, readable and writable spans.
#[derive(Debug)]
pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(INITIAL_CAPACITY)
    }
}

impl Buffer {
    /// Creates a buffer with `capacity` zeroed bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    #[inline]
    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be written without growing or compacting.
    #[inline]
    pub fn writable_len(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Number of already-consumed bytes at the head, reclaimable by
    /// compaction.
    #[inline]
    pub fn prependable_len(&self) -> usize {
        self.read_pos
    }

    /// Borrows the readable span. Valid until the next mutating call.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Marks `len` readable bytes as consumed.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_len());
        self.read_pos += len;
    }

    /// Marks everything up to offset `end` of the readable span as consumed.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    /// Resets the buffer to empty, zeroing the backing region.
    pub fn retrieve_all(&mut self) {
        self.buf.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Copies the readable span into an owned string and resets the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    /// Appends `data`, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Guarantees at least `len` writable bytes.
    ///
    /// If the head space plus the tail space already cover `len`, the
    /// readable span is slid to offset 0 instead of reallocating; otherwise
    /// the region grows to `write_pos + len + 1`.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_len() < len {
            self.make_space(len);
        }
        assert!(self.writable_len() >= len);
    }

    /// Advances the write cursor after bytes were placed directly into the
    /// writable span.
    #[inline]
    fn has_written(&mut self, len: usize) {
        self.write_pos += len;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_len() + self.prependable_len() < len {
            self.buf.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_len();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        }
    }

    /// Scatter-reads from `reader` into the writable span and a 64 KiB stack
    /// overflow region, so one syscall drains the socket even when the
    /// writable span is small. Overflow bytes are appended afterwards, which
    /// may grow the buffer.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize> {
        let mut overflow = [0u8; OVERFLOW_LEN];
        let writable = self.writable_len();

        let n = {
            let (_, tail) = self.buf.split_at_mut(self.write_pos);
            let mut iovs = [IoSliceMut::new(tail), IoSliceMut::new(&mut overflow)];
            reader.read_vectored(&mut iovs)?
        };

        if n <= writable {
            self.has_written(n);
        } else {
            self.write_pos = self.buf.len();
            self.append(&overflow[..n - writable]);
        }

        Ok(n)
    }

    /// Writes the readable span to `writer` once, consuming what was
    /// accepted.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> Result<usize> {
        let n = writer.write(self.peek())?;
        self.retrieve(n);
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use super::{Buffer, OVERFLOW_LEN};

    #[test]
    fn new_buffer_is_empty_with_full_writable_span() {
        let buf = Buffer::new(64);
        assert_eq!(0, buf.readable_len());
        assert_eq!(0, buf.prependable_len());
        assert_eq!(64, buf.writable_len());
    }

    #[test]
    fn append_advances_readable_and_peek_sees_bytes() {
        let mut buf = Buffer::new(64);
        buf.append(b"hello");
        assert_eq!(5, buf.readable_len());
        assert_eq!(b"hello", buf.peek());
        assert_eq!(59, buf.writable_len());
    }

    #[test]
    fn retrieve_moves_bytes_into_prependable_span() {
        let mut buf = Buffer::new(64);
        buf.append(b"hello world");
        buf.retrieve(6);
        assert_eq!(b"world", buf.peek());
        assert_eq!(6, buf.prependable_len());
    }

    #[test]
    #[should_panic]
    fn retrieve_more_than_readable_panics() {
        let mut buf = Buffer::new(64);
        buf.append(b"ab");
        buf.retrieve(3);
    }

    #[test]
    fn retrieve_until_consumes_through_offset() {
        let mut buf = Buffer::new(64);
        buf.append(b"line\r\nrest");
        buf.retrieve_until(6);
        assert_eq!(b"rest", buf.peek());
    }

    #[test]
    fn retrieve_all_to_string_returns_appended_bytes_and_resets() {
        let mut buf = Buffer::new(16);
        buf.append(b"status: ok");
        assert_eq!("status: ok", buf.retrieve_all_to_string());
        assert_eq!(0, buf.readable_len());
        assert_eq!(0, buf.prependable_len());
        assert_eq!(16, buf.writable_len());
    }

    #[test]
    fn append_compacts_head_space_before_growing() {
        let mut buf = Buffer::new(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(10);
        // 0 writable, 10 prependable: sliding makes room without growth.
        buf.append(b"0123456789");
        assert_eq!(b"abcdef0123456789", buf.peek());
        assert_eq!(16, buf.buf.len());
        assert_eq!(0, buf.prependable_len());
    }

    #[test]
    fn append_grows_when_head_space_is_insufficient() {
        let mut buf = Buffer::new(8);
        buf.append(b"abcdefgh");
        buf.retrieve(2);
        buf.append(b"0123456789");
        assert_eq!(b"cdefgh0123456789", buf.peek());
        assert!(buf.buf.len() > 8);
    }

    #[test]
    fn cursor_invariant_holds_after_every_operation() {
        let mut buf = Buffer::new(8);
        let check = |b: &Buffer| {
            assert!(b.read_pos <= b.write_pos);
            assert!(b.write_pos <= b.buf.len());
        };
        check(&buf);
        buf.append(b"abcd");
        check(&buf);
        buf.retrieve(2);
        check(&buf);
        buf.append(&[b'x'; 100]);
        check(&buf);
        buf.retrieve_all();
        check(&buf);
    }

    #[test]
    fn read_from_within_writable_span_advances_write_cursor() {
        let mut buf = Buffer::new(64);
        let mut src = Cursor::new(b"GET / HTTP/1.1\r\n".to_vec());
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(16, n);
        assert_eq!(b"GET / HTTP/1.1\r\n", buf.peek());
    }

    #[test]
    fn read_from_spills_into_overflow_and_grows() {
        let mut buf = Buffer::new(8);
        let payload: Vec<u8> = (0..100u8).collect();
        let mut src = Cursor::new(payload.clone());
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(100, n);
        assert_eq!(payload.as_slice(), buf.peek());
    }

    #[test]
    fn read_from_caps_at_writable_plus_overflow() {
        let mut buf = Buffer::new(8);
        let payload = vec![7u8; 8 + OVERFLOW_LEN + 500];
        let mut src = Cursor::new(payload);
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(8 + OVERFLOW_LEN, n);
        // The excess stays in the source for the next call.
        let n = buf.read_from(&mut src).unwrap();
        assert_eq!(500, n);
    }

    #[test]
    fn write_to_consumes_accepted_bytes() {
        let mut buf = Buffer::new(64);
        buf.append(b"payload");
        let mut sink = Vec::new();
        let n = buf.write_to(&mut sink).unwrap();
        assert_eq!(7, n);
        assert_eq!(b"payload", sink.as_slice());
        assert_eq!(0, buf.readable_len());
    }
}
