//! Channel frame encoding/decoding
//!
//! Frames carried inside the AEAD codec's plaintext stream:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |  Type  | Channel|    Length (2B)  |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```

use super::TransceiverError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum payload carried by one channel frame
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Channel payload
    Data = 0x00,
    /// Channel closed by its initiator
    Close = 0x01,
    /// Keep-alive probe
    Ping = 0x02,
    /// Keep-alive response
    Pong = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = TransceiverError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameType::Data),
            0x01 => Ok(FrameType::Close),
            0x02 => Ok(FrameType::Ping),
            0x03 => Ok(FrameType::Pong),
            _ => Err(TransceiverError::Frame("unknown frame type")),
        }
    }
}

/// A channel frame
#[derive(Debug, Clone)]
pub struct ChannelFrame {
    /// Frame type
    pub frame_type: FrameType,
    /// Channel slot on the carrying connection (0 for link-level frames)
    pub channel: u8,
    /// Payload data
    pub payload: Bytes,
}

impl ChannelFrame {
    /// Create a data frame
    pub fn data(channel: u8, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Data,
            channel,
            payload,
        }
    }

    /// Create a close frame
    pub fn close(channel: u8) -> Self {
        Self {
            frame_type: FrameType::Close,
            channel,
            payload: Bytes::new(),
        }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self {
            frame_type: FrameType::Ping,
            channel: 0,
            payload: Bytes::new(),
        }
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self {
            frame_type: FrameType::Pong,
            channel: 0,
            payload: Bytes::new(),
        }
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());

        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.channel);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `None` when the buffer does not yet hold a whole frame.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TransceiverError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[0])?;
        let channel = buf[1];
        let payload_len = ((buf[2] as usize) << 8) | (buf[3] as usize);

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            channel,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let original = ChannelFrame::data(7, Bytes::from_static(b"through the tunnel"));
        let mut encoded = original.encode();

        let decoded = ChannelFrame::decode(&mut encoded).unwrap().unwrap();

        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.channel, 7);
        assert_eq!(decoded.payload, original.payload);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_incremental_decode() {
        let frame = ChannelFrame::data(1, Bytes::from_static(b"split delivery"));
        let wire = frame.encode();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..3]);

        // Header incomplete
        assert!(ChannelFrame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[3..6]);

        // Payload incomplete
        assert!(ChannelFrame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[6..]);

        let decoded = ChannelFrame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], b"split delivery");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xFF, 0, 0, 0]);

        assert!(matches!(
            ChannelFrame::decode(&mut buf),
            Err(TransceiverError::Frame(_))
        ));
    }

    #[test]
    fn test_control_frames_are_link_level() {
        assert_eq!(ChannelFrame::ping().channel, 0);
        assert_eq!(ChannelFrame::pong().channel, 0);

        let mut encoded = ChannelFrame::ping().encode();
        let decoded = ChannelFrame::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded.frame_type, FrameType::Ping);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ChannelFrame::data(2, Bytes::from_static(b"first")).encode());
        buf.extend_from_slice(&ChannelFrame::close(2).encode());

        let first = ChannelFrame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Data);

        let second = ChannelFrame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Close);
        assert_eq!(second.channel, 2);
    }
}
