//! Length-prefix framing.
//!
//! ISO-8583 links delimit messages with a length header ahead of each
//! payload. Two header styles are common:
//!
//! - 2-byte big-endian binary length
//! - 4 ASCII decimal digits
//!
//! The decoder is stateful only through the caller's buffer: partial frames
//! stay in `src` until the rest arrives.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::{CodecError, Result};

/// Splits a byte stream into frame payloads and back.
pub trait FrameCodec: Send + Sync {
    /// Take one complete frame payload off the front of `src`.
    ///
    /// Returns:
    /// - Ok(Some(payload)) → frame decoded
    /// - Ok(None) → need more data
    /// - Err → framing violation; the connection should be closed
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>>;

    /// Append one framed payload to `dst`.
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()>;
}

/// Length header style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthHeader {
    /// 2-byte big-endian length
    #[default]
    Binary2,
    /// 4 ASCII decimal digits
    Ascii4,
}

impl LengthHeader {
    #[inline]
    pub const fn len(self) -> usize {
        match self {
            Self::Binary2 => 2,
            Self::Ascii4 => 4,
        }
    }

    /// Largest length the header can express.
    #[inline]
    pub const fn limit(self) -> usize {
        match self {
            Self::Binary2 => u16::MAX as usize,
            Self::Ascii4 => 9999,
        }
    }

    fn read(self, header: &[u8]) -> Result<usize> {
        match self {
            Self::Binary2 => Ok(usize::from(u16::from_be_bytes([header[0], header[1]]))),
            Self::Ascii4 => {
                let invalid = || CodecError::InvalidLengthHeader(String::from_utf8_lossy(header).into_owned());
                let text = std::str::from_utf8(header).map_err(|_| invalid())?;
                if !text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                text.parse().map_err(|_| invalid())
            }
        }
    }

    fn write(self, len: usize, dst: &mut BytesMut) {
        match self {
            Self::Binary2 => dst.extend_from_slice(&(len as u16).to_be_bytes()),
            Self::Ascii4 => dst.extend_from_slice(format!("{len:04}").as_bytes()),
        }
    }
}

/// Reference [`FrameCodec`]: a length header followed by the payload.
///
/// Zero-length frames are treated as keep-alives and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPrefixFramer {
    header: LengthHeader,
    max_frame_size: usize,
}

impl LengthPrefixFramer {
    /// Create a framer. `max_frame_size` is clamped to what the header can express.
    pub fn new(header: LengthHeader, max_frame_size: usize) -> Self {
        Self {
            header,
            max_frame_size: max_frame_size.min(header.limit()),
        }
    }

    #[inline]
    pub const fn header(&self) -> LengthHeader {
        self.header
    }

    #[inline]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for LengthPrefixFramer {
    fn default() -> Self {
        Self::new(LengthHeader::Binary2, isoswitch_core::options::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameCodec for LengthPrefixFramer {
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        let header_len = self.header.len();
        loop {
            if src.len() < header_len {
                return Ok(None);
            }

            let body_len = self.header.read(&src[..header_len])?;
            if body_len > self.max_frame_size {
                return Err(CodecError::FrameTooLarge {
                    size: body_len,
                    max: self.max_frame_size,
                });
            }

            if body_len == 0 {
                src.advance(header_len);
                trace!("[Framer] Skipped keep-alive frame");
                continue;
            }

            let total = header_len + body_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(header_len);
            return Ok(Some(src.split_to(body_len).freeze()));
        }
    }

    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
        if payload.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(self.header.len() + payload.len());
        self.header.write(payload.len(), dst);
        dst.extend_from_slice(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_header() {
        let framer = LengthPrefixFramer::new(LengthHeader::Binary2, 1024);
        let mut buf = BytesMut::new();
        framer.encode(b"0800", &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x040800");

        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "0800");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ascii_header() {
        let framer = LengthPrefixFramer::new(LengthHeader::Ascii4, 1024);
        let mut buf = BytesMut::new();
        framer.encode(b"0200ABC", &mut buf).unwrap();
        assert_eq!(&buf[..], b"00070200ABC");
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "0200ABC");
    }

    #[test]
    fn test_partial_frame_waits() {
        let framer = LengthPrefixFramer::new(LengthHeader::Binary2, 1024);
        let mut buf = BytesMut::from(&b"\x00\x0502"[..]);
        assert!(framer.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(b"001\x00\x01");
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "02001");
        assert!(framer.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"X");
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "X");
    }

    #[test]
    fn test_keepalive_skipped() {
        let framer = LengthPrefixFramer::default();
        let mut buf = BytesMut::from(&b"\x00\x00\x00\x00\x00\x02OK"[..]);
        assert_eq!(framer.decode(&mut buf).unwrap().unwrap(), "OK");
    }

    #[test]
    fn test_oversize_rejected() {
        let framer = LengthPrefixFramer::new(LengthHeader::Binary2, 16);
        let mut buf = BytesMut::from(&b"\x01\x00"[..]);
        assert_eq!(
            framer.decode(&mut buf),
            Err(CodecError::FrameTooLarge { size: 256, max: 16 })
        );
        assert!(framer.encode(&[0u8; 17], &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_bad_ascii_header() {
        let framer = LengthPrefixFramer::new(LengthHeader::Ascii4, 1024);
        let mut buf = BytesMut::from(&b"00x2ab"[..]);
        assert!(matches!(
            framer.decode(&mut buf),
            Err(CodecError::InvalidLengthHeader(_))
        ));
    }
}
