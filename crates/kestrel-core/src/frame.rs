//! Length-prefixed framing.
//!
//! ```text
//! [4 bytes: big-endian payload length] [payload]
//! ```
//!
//! One frame carries exactly one protocol message, so a single logical write
//! is always observed as a single logical read on the other end.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{WireError, MAX_FRAME_SIZE};

/// Size of the length prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete; the buffered bytes
/// are left untouched so the caller can read more and try again.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }

    if buf.len() < FRAME_HEADER_SIZE + len {
        buf.reserve(FRAME_HEADER_SIZE + len - buf.len());
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    Ok(Some(buf.split_to(len).freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &5u32.to_be_bytes());

        let mut buf = BytesMut::from(&frame[..]);
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let frame = encode_frame(b"partial payload").unwrap();
        let mut buf = BytesMut::from(&frame[..7]);

        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);

        buf.extend_from_slice(&frame[7..]);
        let payload = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], b"partial payload");
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"one").unwrap());
        buf.extend_from_slice(&encode_frame(b"").unwrap());
        buf.extend_from_slice(&encode_frame(b"three").unwrap());

        assert_eq!(&decode_frame(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&decode_frame(&mut buf).unwrap().unwrap()[..], b"");
        assert_eq!(&decode_frame(&mut buf).unwrap().unwrap()[..], b"three");
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&big),
            Err(WireError::FrameTooLarge(_))
        ));

        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(WireError::FrameTooLarge(_))
        ));
    }
}
