//! Growable byte buffer with read/write cursors and a prepend reserve.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! |                   |                  |                  |
//! 0      <=      reader_index   <=   writer_index    <=    len
//! ```
//!
//! The reader index never drops below [`Buffer::CHEAP_PREPEND`], so a
//! fixed-size length header can always be prepended in place. Integers are
//! encoded in network byte order.

use std::io::{self, IoSliceMut, Read, Write};

const CRLF: &[u8] = b"\r\n";
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct Buffer {
    buffer: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(Self::INITIAL_SIZE)
    }
}

impl Buffer {
    pub const CHEAP_PREPEND: usize = 8;
    pub const INITIAL_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            buffer: vec![0; Self::CHEAP_PREPEND + initial_size],
            reader_index: Self::CHEAP_PREPEND,
            writer_index: Self::CHEAP_PREPEND,
        }
    }

    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.buffer.len() - self.writer_index
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.buffer[self.reader_index..self.writer_index]
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    /// Offset of the first `\r\n` at or after `start`, both relative to
    /// the readable region.
    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(CRLF.len())
            .position(|window| window == CRLF)
            .map(|pos| pos + start)
    }

    /// Offset of the first `\n` in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| pos + start)
    }

    /// Consumes `len` readable bytes.
    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve {len} bytes out of {}",
            self.readable_bytes()
        );
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consumes everything before the readable-region offset `end`.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end);
    }

    pub fn retrieve_i64(&mut self) {
        self.retrieve(8);
    }

    pub fn retrieve_i32(&mut self) {
        self.retrieve(4);
    }

    pub fn retrieve_i16(&mut self) {
        self.retrieve(2);
    }

    pub fn retrieve_i8(&mut self) {
        self.retrieve(1);
    }

    pub fn retrieve_all(&mut self) {
        self.reader_index = Self::CHEAP_PREPEND;
        self.writer_index = Self::CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable_bytes())
    }

    /// Consumes `len` bytes as text; invalid UTF-8 is replaced.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let text = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        text
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// The writable region, for callers that fill it directly and then
    /// commit with [`Buffer::has_written`].
    pub fn begin_write(&mut self) -> &mut [u8] {
        let start = self.writer_index;
        &mut self.buffer[start..]
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer_index += len;
    }

    /// Drops the last `len` written bytes.
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer_index -= len;
    }

    pub fn append_i64(&mut self, x: i64) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i32(&mut self, x: i32) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i16(&mut self, x: i16) {
        self.append(&x.to_be_bytes());
    }

    pub fn append_i8(&mut self, x: i8) {
        self.append(&x.to_be_bytes());
    }

    pub fn read_i64(&mut self) -> i64 {
        let x = self.peek_i64();
        self.retrieve_i64();
        x
    }

    pub fn read_i32(&mut self) -> i32 {
        let x = self.peek_i32();
        self.retrieve_i32();
        x
    }

    pub fn read_i16(&mut self) -> i16 {
        let x = self.peek_i16();
        self.retrieve_i16();
        x
    }

    pub fn read_i8(&mut self) -> i8 {
        let x = self.peek_i8();
        self.retrieve_i8();
        x
    }

    pub fn peek_i64(&self) -> i64 {
        i64::from_be_bytes(self.peek_array())
    }

    pub fn peek_i32(&self) -> i32 {
        i32::from_be_bytes(self.peek_array())
    }

    pub fn peek_i16(&self) -> i16 {
        i16::from_be_bytes(self.peek_array())
    }

    pub fn peek_i8(&self) -> i8 {
        i8::from_be_bytes(self.peek_array())
    }

    fn peek_array<const N: usize>(&self) -> [u8; N] {
        assert!(
            self.readable_bytes() >= N,
            "peek {N} bytes out of {}",
            self.readable_bytes()
        );
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.peek()[..N]);
        bytes
    }

    /// Writes `data` immediately in front of the readable region.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend {} bytes with {} prependable",
            data.len(),
            self.prependable_bytes()
        );
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buffer[start..start + data.len()].copy_from_slice(data);
    }

    pub fn prepend_i64(&mut self, x: i64) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i32(&mut self, x: i32) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i16(&mut self, x: i16) {
        self.prepend(&x.to_be_bytes());
    }

    pub fn prepend_i8(&mut self, x: i8) {
        self.prepend(&x.to_be_bytes());
    }

    /// Releases excess capacity, keeping `reserve` writable bytes.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        self.swap(&mut other);
    }

    pub fn internal_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Reads once from `reader`, spilling into a 64 KiB stack region when
    /// the writable space is smaller, so one call can take in a large
    /// message without growing the buffer up front.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let n = {
            let start = self.writer_index;
            let mut bufs = [
                IoSliceMut::new(&mut self.buffer[start..]),
                IoSliceMut::new(&mut extra),
            ];
            let iovcnt = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };
            reader.read_vectored(&mut bufs[..iovcnt])?
        };
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buffer.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Self::CHEAP_PREPEND {
            self.buffer.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buffer
                .copy_within(self.reader_index..self.writer_index, Self::CHEAP_PREPEND);
            self.reader_index = Self::CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);

        let text = "x".repeat(200);
        buf.append(text.as_bytes());
        assert_eq!(buf.readable_bytes(), text.len());
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE - text.len());

        let head = buf.retrieve_as_string(50);
        assert_eq!(head.len(), 50);
        assert_eq!(buf.readable_bytes(), text.len() - 50);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND + 50);

        buf.append(text.as_bytes());
        assert_eq!(buf.readable_bytes(), 2 * text.len() - 50);

        let rest = buf.retrieve_all_as_string();
        assert_eq!(rest.len(), 350);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn test_grow() {
        let mut buf = Buffer::new();
        buf.append(&[b'y'; 400]);
        buf.retrieve(50);
        buf.append(&[b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1350);
        assert_eq!(buf.writable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND + 50);

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), 1400);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn test_compact_instead_of_grow() {
        let mut buf = Buffer::new();
        buf.append(&[b'y'; 800]);
        buf.retrieve(500);
        let capacity = buf.buffer.len();

        buf.append(&[b'z'; 300]);
        assert_eq!(buf.buffer.len(), capacity);
        assert_eq!(buf.readable_bytes(), 600);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE - 600);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
        assert!(buf.peek()[..300].iter().all(|&b| b == b'y'));
        assert!(buf.peek()[300..].iter().all(|&b| b == b'z'));
    }

    #[test]
    fn test_shrink() {
        let mut buf = Buffer::new();
        buf.append(&[b'y'; 2000]);
        buf.retrieve(1500);
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(buf.writable_bytes(), 0);
        assert_eq!(buf.retrieve_all_as_bytes(), vec![b'y'; 500]);
    }

    #[test]
    fn test_prepend() {
        let mut buf = Buffer::new();
        buf.append(&[b'y'; 200]);
        buf.prepend_i32(200);
        assert_eq!(buf.readable_bytes(), 204);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND - 4);
        assert_eq!(buf.read_i32(), 200);
        assert_eq!(buf.readable_bytes(), 200);
    }

    #[test]
    fn test_read_ints() {
        let mut buf = Buffer::new();
        buf.append(b"HTTP");
        assert_eq!(buf.peek_i8(), b'H' as i8);
        let top16 = buf.peek_i16();
        assert_eq!(top16, (b'H' as i16) * 256 + b'T' as i16);
        assert_eq!(buf.peek_i32(), i32::from_be_bytes(*b"HTTP"));

        assert_eq!(buf.read_i8(), b'H' as i8);
        assert_eq!(buf.read_i16(), (b'T' as i16) * 256 + b'T' as i16);
        assert_eq!(buf.read_i8(), b'P' as i8);
        assert_eq!(buf.readable_bytes(), 0);

        buf.append_i8(-1);
        buf.append_i16(-2);
        buf.append_i32(-3);
        buf.append_i64(-4);
        assert_eq!(buf.readable_bytes(), 15);
        assert_eq!(buf.read_i8(), -1);
        assert_eq!(buf.read_i16(), -2);
        assert_eq!(buf.read_i32(), -3);
        assert_eq!(buf.read_i64(), -4);
    }

    #[test]
    fn test_find_eol_and_crlf() {
        let mut buf = Buffer::new();
        buf.append(&[b'x'; 100_000]);
        assert_eq!(buf.find_eol(), None);
        assert_eq!(buf.find_eol_from(90_000), None);
        assert_eq!(buf.find_crlf(), None);

        buf.retrieve_all();
        buf.append(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_crlf_from(15), Some(23));
        assert_eq!(buf.find_eol(), Some(15));
        buf.retrieve_until(16);
        assert!(buf.peek().starts_with(b"Host"));
    }

    #[test]
    fn test_unwrite_and_begin_write() {
        let mut buf = Buffer::new();
        buf.begin_write()[..3].copy_from_slice(b"abc");
        buf.has_written(3);
        buf.unwrite(1);
        assert_eq!(buf.peek(), b"ab");
    }

    #[test]
    fn test_read_from_spills_into_extra() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut buf = Buffer::with_capacity(16);
        let n = buf.read_from(&mut payload.as_slice()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), payload.as_slice());
    }

    #[test]
    fn test_write_impl_appends() {
        let mut buf = Buffer::new();
        write!(buf, "{}-{}", 1, 2).unwrap();
        assert_eq!(buf.retrieve_all_as_string(), "1-2");
    }

    proptest! {
        #[test]
        fn prop_i32_round_trip(x in any::<i32>()) {
            let mut buf = Buffer::new();
            buf.append_i32(x);
            prop_assert_eq!(buf.read_i32(), x);
            prop_assert!(buf.is_empty());
        }

        #[test]
        fn prop_append_retrieve_accounting(
            ops in proptest::collection::vec((proptest::collection::vec(any::<u8>(), 0..300), 0usize..400), 1..40)
        ) {
            let mut buf = Buffer::new();
            let mut expected: Vec<u8> = Vec::new();
            let mut appended = 0usize;
            let mut consumed = 0usize;
            for (data, take) in ops {
                buf.append(&data);
                appended += data.len();
                expected.extend_from_slice(&data);

                let take = take.min(buf.readable_bytes());
                let got = buf.retrieve_as_bytes(take);
                prop_assert_eq!(&got[..], &expected[..take]);
                expected.drain(..take);
                consumed += take;

                prop_assert_eq!(buf.readable_bytes() + consumed, appended);
                prop_assert!(buf.prependable_bytes() >= Buffer::CHEAP_PREPEND);
            }
            buf.prepend(&[0u8; Buffer::CHEAP_PREPEND]);
            buf.retrieve(Buffer::CHEAP_PREPEND);
            prop_assert_eq!(buf.retrieve_all_as_bytes(), expected);
        }
    }
}
