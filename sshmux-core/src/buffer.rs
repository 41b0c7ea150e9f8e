use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Hard ceiling on a single channel buffer. A peer that manages to queue this
/// much has long stopped behaving; refusing the append kills the channel, not
/// the process.
pub const BUFFER_MAX: usize = 0x0800_0000;

#[derive(Debug, thiserror::Error)]
#[error("buffer full: {requested} bytes would exceed the {max} byte maximum")]
pub struct BufferFull {
    pub requested: usize,
    pub max: usize,
}

/// A growable FIFO of bytes.
///
/// Data is appended at the tail and consumed from the head; the readable
/// region is always contiguous. Callers must not hold the head slice across
/// any mutating call; the borrow checker enforces what the C original could
/// only document.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: BytesMut,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The readable head.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the readable head, for in-place rewrites.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Drop `n` bytes from the head.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.data.len(), "consume past end of buffer");
        self.data.advance(n);
    }

    /// True if `n` more bytes can be appended without crossing the ceiling.
    pub fn check_reserve(&self, n: usize) -> bool {
        self.data.len().saturating_add(n) <= BUFFER_MAX
    }

    pub fn put(&mut self, data: &[u8]) -> Result<(), BufferFull> {
        if !self.check_reserve(data.len()) {
            return Err(BufferFull {
                requested: data.len(),
                max: BUFFER_MAX,
            });
        }
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Append `data` framed with a u32 length, preserving datagram
    /// boundaries inside the stream buffer.
    pub fn put_string(&mut self, data: &[u8]) -> Result<(), BufferFull> {
        if !self.check_reserve(data.len() + 4) {
            return Err(BufferFull {
                requested: data.len() + 4,
                max: BUFFER_MAX,
            });
        }
        self.data.put_u32(data.len() as u32);
        self.data.extend_from_slice(data);
        Ok(())
    }

    /// Take one length-framed datagram off the head, if a complete one is
    /// buffered.
    pub fn get_string(&mut self) -> Option<Bytes> {
        let len = self.peek_u32()? as usize;
        if self.data.len() < 4 + len {
            return None;
        }
        self.data.advance(4);
        Some(self.data.split_to(len).freeze())
    }

    pub fn peek_u32(&self) -> Option<u32> {
        if self.data.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes(self.data[..4].try_into().ok()?))
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Write the head to `writer` once, consuming what was accepted.
    /// `Ok(0)` means the writer is closed.
    pub fn write_to<W: io::Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        let n = writer.write(&self.data)?;
        self.data.advance(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockSink {
        data: Vec<u8>,
        chunk: usize,
    }

    impl io::Write for MockSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.chunk == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = min(self.chunk, buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let mut buffer = ByteBuffer::new();
        buffer.put(b"abc").unwrap();
        buffer.put(b"def").unwrap();
        assert_eq!(buffer.bytes(), b"abcdef");
        buffer.consume(2);
        assert_eq!(buffer.bytes(), b"cdef");
        buffer.put(b"gh").unwrap();
        assert_eq!(buffer.bytes(), b"cdefgh");
    }

    #[test]
    fn short_writes_consume_only_what_was_written() {
        let mut buffer = ByteBuffer::new();
        buffer.put(b"0123456789").unwrap();
        let mut sink = MockSink {
            data: Vec::new(),
            chunk: 4,
        };
        assert_eq!(buffer.write_to(&mut sink).unwrap(), 4);
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.write_to(&mut sink).unwrap(), 4);
        assert_eq!(buffer.write_to(&mut sink).unwrap(), 2);
        assert!(buffer.is_empty());
        assert_eq!(sink.data, b"0123456789");
    }

    #[test]
    fn would_block_propagates_without_consuming() {
        let mut buffer = ByteBuffer::new();
        buffer.put(b"xyz").unwrap();
        let mut sink = MockSink {
            data: Vec::new(),
            chunk: 0,
        };
        let err = buffer.write_to(&mut sink).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn datagram_framing_roundtrip() {
        let mut buffer = ByteBuffer::new();
        buffer.put_string(b"first").unwrap();
        buffer.put_string(b"").unwrap();
        buffer.put_string(b"second").unwrap();
        assert_eq!(buffer.get_string().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(buffer.get_string().unwrap(), Bytes::from_static(b""));
        assert_eq!(buffer.get_string().unwrap(), Bytes::from_static(b"second"));
        assert!(buffer.get_string().is_none());
    }

    #[test]
    fn partial_datagram_not_taken() {
        let mut buffer = ByteBuffer::new();
        buffer.put(&[0, 0, 0, 5, b'a', b'b']).unwrap();
        assert!(buffer.get_string().is_none());
        buffer.put(b"cde").unwrap();
        assert_eq!(buffer.get_string().unwrap(), Bytes::from_static(b"abcde"));
    }

    #[test]
    fn reserve_check_against_ceiling() {
        let buffer = ByteBuffer::new();
        assert!(buffer.check_reserve(BUFFER_MAX));
        assert!(!buffer.check_reserve(BUFFER_MAX + 1));
    }
}
