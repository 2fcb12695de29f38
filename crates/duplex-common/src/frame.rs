use std::io::{BufReader, BufWriter, Cursor, Read, Write};

use crate::error::{Result, TransportError};

/// Maximum frame size (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Size of the big-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// One self-delimited unit of data read from a connection.
///
/// The transport never looks inside the payload; deserialization belongs to
/// the layer consuming the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns a reader positioned at the start of the payload.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.payload.as_slice())
    }
}

/// Buffered reader of length-prefixed frames.
///
/// Wire format: `[4-byte length as u32 big-endian] + [data]`
pub struct FrameReader<R: Read> {
    inner: BufReader<R>,
    max_frame_size: usize,
    frames_read: u64,
    bytes_read: u64,
}

impl<R: Read> FrameReader<R> {
    /// Wraps `inner` with a read buffer of `buffer_size` bytes.
    pub fn new(inner: R, buffer_size: usize) -> Self {
        Self {
            inner: BufReader::with_capacity(buffer_size.max(LENGTH_PREFIX_SIZE), inner),
            max_frame_size: MAX_FRAME_SIZE,
            frames_read: 0,
            bytes_read: 0,
        }
    }

    /// Lowers the accepted frame size, used while reading handshake payloads.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Reads the next frame, blocking until all of its bytes have arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The stream ends or fails while reading the prefix or the payload
    /// - The announced length exceeds the maximum frame size
    pub fn read_frame(&mut self) -> Result<Frame> {
        let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
        self.inner
            .read_exact(&mut len_buf)
            .map_err(|e| TransportError::from_io(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;

        // Reject before allocating
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .map_err(|e| TransportError::from_io(e, "reading frame data"))?;

        self.frames_read += 1;
        self.bytes_read += (LENGTH_PREFIX_SIZE + len) as u64;
        Ok(Frame { payload })
    }

    /// Returns `(frames, bytes)` read since the previous call and resets the
    /// counters.
    pub fn take_counts(&mut self) -> (u64, u64) {
        let counts = (self.frames_read, self.bytes_read);
        self.frames_read = 0;
        self.bytes_read = 0;
        counts
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

/// Buffered writer of length-prefixed frames.
///
/// Frames are buffered until [`flush`](Self::flush) so a caller can batch
/// several frames into one write while holding the connection's write lock.
pub struct FrameWriter<W: Write> {
    inner: BufWriter<W>,
    frames_written: u64,
    bytes_written: u64,
}

impl<W: Write> FrameWriter<W> {
    /// Wraps `inner` with a write buffer of `buffer_size` bytes.
    pub fn new(inner: W, buffer_size: usize) -> Self {
        Self {
            inner: BufWriter::with_capacity(buffer_size.max(LENGTH_PREFIX_SIZE), inner),
            frames_written: 0,
            bytes_written: 0,
        }
    }

    /// Writes one frame (prefix and payload) into the buffer.
    pub fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let len = payload.len() as u32;
        self.inner
            .write_all(&len.to_be_bytes())
            .map_err(|e| TransportError::from_io(e, "writing length prefix"))?;
        self.inner
            .write_all(payload)
            .map_err(|e| TransportError::from_io(e, "writing frame data"))?;

        self.frames_written += 1;
        self.bytes_written += (LENGTH_PREFIX_SIZE + payload.len()) as u64;
        Ok(())
    }

    /// Pushes every buffered byte to the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.inner
            .flush()
            .map_err(|e| TransportError::from_io(e, "flushing stream"))
    }

    /// Returns `(frames, bytes)` written since the previous call and resets
    /// the counters.
    pub fn take_counts(&mut self) -> (u64, u64) {
        let counts = (self.frames_written, self.bytes_written);
        self.frames_written = 0;
        self.bytes_written = 0;
        counts
    }

    pub fn get_ref(&self) -> &W {
        self.inner.get_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frames: &[&[u8]]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new(), 64);
        for frame in frames {
            writer.write_frame(frame).unwrap();
        }
        writer.flush().unwrap();
        writer.inner.into_inner().unwrap()
    }

    #[test]
    fn test_frames_are_length_prefixed() {
        let bytes = encode(&[b"abc"]);
        assert_eq!(bytes, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_reads_frames_in_order() {
        let bytes = encode(&[b"first", b"", b"third"]);
        let mut reader = FrameReader::new(Cursor::new(bytes), 16);

        assert_eq!(reader.read_frame().unwrap().as_bytes(), b"first");
        assert!(reader.read_frame().unwrap().is_empty());
        assert_eq!(reader.read_frame().unwrap().as_bytes(), b"third");
        assert_eq!(reader.take_counts(), (3, 22));
    }

    #[test]
    fn test_eof_is_connection_lost() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()), 16);
        assert!(matches!(
            reader.read_frame(),
            Err(TransportError::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_connection_lost() {
        let mut bytes = encode(&[b"hello world"]);
        bytes.truncate(8);
        let mut reader = FrameReader::new(Cursor::new(bytes), 16);
        assert!(matches!(
            reader.read_frame(),
            Err(TransportError::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let bytes = (1024u32).to_be_bytes().to_vec();
        let mut reader = FrameReader::new(Cursor::new(bytes), 16).with_max_frame_size(512);
        match reader.read_frame() {
            Err(TransportError::FrameTooLarge { size, max }) => {
                assert_eq!(size, 1024);
                assert_eq!(max, 512);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_take_counts_resets() {
        let mut writer = FrameWriter::new(Vec::new(), 64);
        writer.write_frame(b"12345").unwrap();
        writer.write_frame(b"").unwrap();
        assert_eq!(writer.take_counts(), (2, 13));
        assert_eq!(writer.take_counts(), (0, 0));
    }

    #[test]
    fn test_frame_reader_cursor() {
        let frame = Frame::new(b"payload".to_vec());
        let mut out = String::new();
        frame.reader().read_to_string(&mut out).unwrap();
        assert_eq!(out, "payload");
        assert_eq!(frame.len(), 7);
    }
}
