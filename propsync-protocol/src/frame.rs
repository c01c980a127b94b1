//! Stream framing disciplines.
//!
//! A connection is configured with exactly one [`FramingMode`]:
//!
//! - `Unframed`: every read is delivered as-is, writes go out verbatim.
//! - `Fixed`: every message is exactly `packet_size` bytes.
//! - `Controlled`: every message is preceded by a header carrying a magic
//!   constant and the payload length.
//!
//! Controlled header layout (C layout, native endian, same-host peers only):
//!
//! ```text
//! +--------+---------+----------------------+
//! | magic  | padding | size                 |
//! | i32    | to isize| isize                |
//! +--------+---------+----------------------+
//! ```
//!
//! On 64-bit targets the header is 16 bytes; padding is zero on send and
//! ignored on receive.

use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use std::mem::{align_of, size_of};

/// Magic constant opening every controlled-mode header.
pub const MAGIC: i32 = 0x4765_6d42;

/// Default packet size (receive buffer size for unframed and controlled mode).
pub const DEFAULT_PACKET_SIZE: usize = 256;

const MAGIC_SIZE: usize = size_of::<i32>();

const SIZE_FIELD_OFFSET: usize = if align_of::<isize>() > MAGIC_SIZE {
    align_of::<isize>()
} else {
    MAGIC_SIZE
};

/// Size of a controlled-mode header in bytes.
pub const HEADER_SIZE: usize = SIZE_FIELD_OFFSET + size_of::<isize>();

/// Framing discipline of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Unframed,
    Fixed,
    Controlled,
}

/// Framing discipline plus its size parameter.
///
/// For `Fixed` the size is the exact message size; for the other modes it is
/// the initial receive buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub mode: FramingMode,
    pub packet_size: usize,
}

impl Framing {
    /// Creates a framing; a zero size falls back to [`DEFAULT_PACKET_SIZE`].
    pub fn new(mode: FramingMode, packet_size: usize) -> Self {
        let packet_size = if packet_size == 0 {
            DEFAULT_PACKET_SIZE
        } else {
            packet_size
        };
        Self { mode, packet_size }
    }

    pub fn unframed(buffer_size: usize) -> Self {
        Self::new(FramingMode::Unframed, buffer_size)
    }

    pub fn fixed(packet_size: usize) -> Self {
        Self::new(FramingMode::Fixed, packet_size)
    }

    pub fn controlled(buffer_size: usize) -> Self {
        Self::new(FramingMode::Controlled, buffer_size)
    }

    /// Validates an outgoing message of `len` bytes and returns the header
    /// that must precede it, if any.
    ///
    /// Fixed mode rejects any length other than the configured packet size,
    /// so the caller must not write anything on error.
    pub fn prepare_send(&self, len: usize) -> Result<Option<[u8; HEADER_SIZE]>, ProtocolError> {
        match self.mode {
            FramingMode::Unframed => Ok(None),
            FramingMode::Fixed => {
                if len != self.packet_size {
                    return Err(ProtocolError::FixedSizeMismatch {
                        expected: self.packet_size,
                        actual: len,
                    });
                }
                Ok(None)
            }
            FramingMode::Controlled => {
                if len == 0 || len > isize::MAX as usize {
                    return Err(ProtocolError::InvalidSize(len as i64));
                }
                Ok(Some(encode_header(len)))
            }
        }
    }
}

impl Default for Framing {
    fn default() -> Self {
        Self::controlled(DEFAULT_PACKET_SIZE)
    }
}

/// Encodes a controlled-mode header announcing `size` payload bytes.
pub fn encode_header(size: usize) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..MAGIC_SIZE].copy_from_slice(&MAGIC.to_ne_bytes());
    header[SIZE_FIELD_OFFSET..].copy_from_slice(&(size as isize).to_ne_bytes());
    header
}

/// Decodes a controlled-mode header, returning the announced payload size.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<usize, ProtocolError> {
    let mut magic = [0u8; MAGIC_SIZE];
    magic.copy_from_slice(&header[..MAGIC_SIZE]);
    let magic = i32::from_ne_bytes(magic);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: MAGIC,
            actual: magic,
        });
    }

    let mut size = [0u8; size_of::<isize>()];
    size.copy_from_slice(&header[SIZE_FIELD_OFFSET..]);
    let size = isize::from_ne_bytes(size);
    if size <= 0 {
        return Err(ProtocolError::InvalidSize(size as i64));
    }
    Ok(size as usize)
}

/// Reassembles messages from successive socket reads.
///
/// The owner asks [`wanted`](Self::wanted) how many bytes to read next and
/// feeds each read result to [`on_received`](Self::on_received). A read
/// larger than what was wanted is an overrun.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    header: [u8; HEADER_SIZE],
    header_filled: usize,
    expected: Option<usize>,
    buffer: BytesMut,
    capacity: usize,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            header: [0u8; HEADER_SIZE],
            header_filled: 0,
            expected: None,
            buffer: BytesMut::with_capacity(framing.packet_size),
            capacity: framing.packet_size,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Switches framing and drops any partially received message.
    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
        self.discard_partial();
        if framing.packet_size > self.capacity {
            self.buffer.reserve(framing.packet_size);
            self.capacity = framing.packet_size;
        }
    }

    /// Drops the partially received message and waits for the next header.
    pub fn discard_partial(&mut self) {
        self.header_filled = 0;
        self.expected = None;
        self.buffer.clear();
    }

    /// Releases the receive buffer.
    pub fn clear(&mut self) {
        self.discard_partial();
        self.buffer = BytesMut::new();
        self.capacity = 0;
    }

    /// Current receive buffer capacity.
    ///
    /// Grows only when a controlled header declares a larger message.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether part of a message has been received.
    pub fn has_partial(&self) -> bool {
        self.header_filled > 0 || !self.buffer.is_empty()
    }

    /// Maximum number of bytes the next read may return.
    pub fn wanted(&self) -> usize {
        match self.framing.mode {
            FramingMode::Unframed => self.framing.packet_size,
            FramingMode::Fixed => self.framing.packet_size,
            FramingMode::Controlled => match self.expected {
                None => HEADER_SIZE - self.header_filled,
                Some(expected) => expected - self.buffer.len(),
            },
        }
    }

    /// Consumes one read result.
    ///
    /// Returns `Ok(Some(message))` when a complete message is available.
    pub fn on_received(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, ProtocolError> {
        if chunk.is_empty() {
            return Ok(None);
        }

        let wanted = self.wanted();
        if chunk.len() > wanted {
            return Err(ProtocolError::Overrun {
                expected: wanted,
                received: chunk.len(),
            });
        }

        match self.framing.mode {
            FramingMode::Unframed => Ok(Some(Bytes::copy_from_slice(chunk))),
            FramingMode::Fixed => {
                if chunk.len() != self.framing.packet_size {
                    return Err(ProtocolError::FixedSizeMismatch {
                        expected: self.framing.packet_size,
                        actual: chunk.len(),
                    });
                }
                Ok(Some(Bytes::copy_from_slice(chunk)))
            }
            FramingMode::Controlled => self.on_controlled(chunk),
        }
    }

    fn on_controlled(&mut self, chunk: &[u8]) -> Result<Option<Bytes>, ProtocolError> {
        let Some(expected) = self.expected else {
            let end = self.header_filled + chunk.len();
            self.header[self.header_filled..end].copy_from_slice(chunk);
            self.header_filled = end;
            if self.header_filled < HEADER_SIZE {
                return Ok(None);
            }

            let size = decode_header(&self.header)?;
            if size > self.capacity {
                self.buffer.reserve(size);
                self.capacity = size;
            }
            self.expected = Some(size);
            return Ok(None);
        };

        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() < expected {
            return Ok(None);
        }

        let message = self.buffer.split().freeze();
        self.header_filled = 0;
        self.expected = None;
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Produces the exact byte stream a controlled-mode sender writes.
    fn controlled_stream(payload: &[u8]) -> Vec<u8> {
        let framing = Framing::controlled(DEFAULT_PACKET_SIZE);
        let header = framing.prepare_send(payload.len()).unwrap().unwrap();
        let mut stream = header.to_vec();
        stream.extend_from_slice(payload);
        stream
    }

    /// Feeds a stream the way a socket reader would, never reading more
    /// than the decoder asks for.
    fn feed(decoder: &mut FrameDecoder, mut stream: &[u8], max_read: usize) -> Vec<Bytes> {
        let mut messages = Vec::new();
        while !stream.is_empty() {
            let n = decoder.wanted().min(max_read).min(stream.len());
            let (chunk, rest) = stream.split_at(n);
            if let Some(msg) = decoder.on_received(chunk).unwrap() {
                messages.push(msg);
            }
            stream = rest;
        }
        messages
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(HEADER_SIZE, 2 * size_of::<isize>().max(4));
        let header = encode_header(42);
        assert_eq!(&header[..4], &MAGIC.to_ne_bytes());
        assert_eq!(decode_header(&header).unwrap(), 42);
    }

    #[test]
    fn test_controlled_roundtrip_sizes() {
        for n in [1usize, 16, 17, 1000] {
            let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let stream = controlled_stream(&payload);

            let mut decoder = FrameDecoder::new(Framing::default());
            let messages = feed(&mut decoder, &stream, usize::MAX);

            assert_eq!(messages.len(), 1, "size {}", n);
            assert_eq!(messages[0].as_ref(), payload.as_slice());
            assert!(!decoder.has_partial());
        }
    }

    #[test]
    fn test_controlled_back_to_back_messages() {
        let mut stream = controlled_stream(b"first");
        stream.extend(controlled_stream(b"second"));

        let mut decoder = FrameDecoder::new(Framing::default());
        let messages = feed(&mut decoder, &stream, usize::MAX);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].as_ref(), b"first");
        assert_eq!(messages[1].as_ref(), b"second");
    }

    #[test]
    fn test_header_split_across_reads() {
        let stream = controlled_stream(b"split");
        let mut decoder = FrameDecoder::new(Framing::default());
        let messages = feed(&mut decoder, &stream, 3);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].as_ref(), b"split");
    }

    #[test]
    fn test_overrun_rejected() {
        let mut decoder = FrameDecoder::new(Framing::default());
        let header = encode_header(4);
        assert!(decoder.on_received(&header).unwrap().is_none());

        let result = decoder.on_received(b"too many bytes");
        assert_eq!(
            result,
            Err(ProtocolError::Overrun {
                expected: 4,
                received: 14,
            })
        );
    }

    #[test]
    fn test_overrun_after_partial_body() {
        let mut decoder = FrameDecoder::new(Framing::default());
        decoder.on_received(&encode_header(4)).unwrap();
        assert!(decoder.on_received(b"ab").unwrap().is_none());
        assert!(matches!(
            decoder.on_received(b"cde"),
            Err(ProtocolError::Overrun { .. })
        ));
    }

    #[test]
    fn test_invalid_magic() {
        let mut header = encode_header(8);
        header[0] ^= 0xFF;
        let mut decoder = FrameDecoder::new(Framing::default());
        assert!(matches!(
            decoder.on_received(&header),
            Err(ProtocolError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn test_non_positive_size() {
        let mut header = encode_header(1);
        header[SIZE_FIELD_OFFSET..].copy_from_slice(&0isize.to_ne_bytes());
        assert_eq!(decode_header(&header), Err(ProtocolError::InvalidSize(0)));

        header[SIZE_FIELD_OFFSET..].copy_from_slice(&(-5isize).to_ne_bytes());
        assert_eq!(decode_header(&header), Err(ProtocolError::InvalidSize(-5)));
    }

    #[test]
    fn test_buffer_grows_only_for_larger_messages() {
        let mut decoder = FrameDecoder::new(Framing::controlled(64));
        feed(&mut decoder, &controlled_stream(&[1u8; 10]), usize::MAX);
        assert_eq!(decoder.capacity(), 64);

        feed(&mut decoder, &controlled_stream(&[2u8; 300]), usize::MAX);
        assert_eq!(decoder.capacity(), 300);

        feed(&mut decoder, &controlled_stream(&[3u8; 20]), usize::MAX);
        assert_eq!(decoder.capacity(), 300);
    }

    #[test]
    fn test_discard_partial_resumes_at_header() {
        let mut decoder = FrameDecoder::new(Framing::default());
        decoder.on_received(&encode_header(10)).unwrap();
        decoder.on_received(b"half").unwrap();
        assert!(decoder.has_partial());

        decoder.discard_partial();
        assert!(!decoder.has_partial());
        assert_eq!(decoder.wanted(), HEADER_SIZE);

        let messages = feed(&mut decoder, &controlled_stream(b"next"), usize::MAX);
        assert_eq!(messages[0].as_ref(), b"next");
    }

    #[test]
    fn test_set_framing_resets_state() {
        let mut decoder = FrameDecoder::new(Framing::default());
        decoder.on_received(&encode_header(10)).unwrap();

        decoder.set_framing(Framing::fixed(4));
        assert!(!decoder.has_partial());
        assert_eq!(decoder.wanted(), 4);
        assert_eq!(
            decoder.on_received(b"abcd").unwrap().unwrap().as_ref(),
            b"abcd"
        );
    }

    #[test]
    fn test_fixed_short_read_is_error() {
        let mut decoder = FrameDecoder::new(Framing::fixed(8));
        assert_eq!(
            decoder.on_received(b"abc"),
            Err(ProtocolError::FixedSizeMismatch {
                expected: 8,
                actual: 3,
            })
        );
    }

    #[test]
    fn test_fixed_send_mismatch() {
        let framing = Framing::fixed(8);
        assert!(framing.prepare_send(8).unwrap().is_none());
        assert_eq!(
            framing.prepare_send(7),
            Err(ProtocolError::FixedSizeMismatch {
                expected: 8,
                actual: 7,
            })
        );
    }

    #[test]
    fn test_unframed_passthrough() {
        let mut decoder = FrameDecoder::new(Framing::unframed(16));
        assert_eq!(decoder.wanted(), 16);
        assert_eq!(decoder.on_received(b"raw").unwrap().unwrap().as_ref(), b"raw");
        assert!(Framing::unframed(16).prepare_send(100).unwrap().is_none());
    }

    #[test]
    fn test_zero_size_falls_back_to_default() {
        assert_eq!(Framing::controlled(0).packet_size, DEFAULT_PACKET_SIZE);
        assert!(Framing::controlled(0).prepare_send(0).is_err());
    }

    proptest! {
        #[test]
        fn prop_controlled_any_chunking(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..600), 1..5),
            max_read in 1usize..64,
        ) {
            let mut stream = Vec::new();
            for payload in &payloads {
                stream.extend(controlled_stream(payload));
            }

            let mut decoder = FrameDecoder::new(Framing::controlled(32));
            let messages = feed(&mut decoder, &stream, max_read);

            prop_assert_eq!(messages.len(), payloads.len());
            for (msg, payload) in messages.iter().zip(&payloads) {
                prop_assert_eq!(msg.as_ref(), payload.as_slice());
            }
        }
    }
}
