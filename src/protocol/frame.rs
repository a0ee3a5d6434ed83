//! Length-prefixed frame codec (spec §6):
//!
//! `uint32 totalSize | uint32 commandSize | CommandHeader(commandSize bytes) | [optional payload]`
//!
//! `totalSize` excludes itself. This is the boundary between the proxy's
//! decoding path and splice mode: once a `ProxyConnection` enters
//! `ProxyConnectionToEndpoint`, the `FrameCodec` is dropped in favor of a
//! raw byte forwarder (see `direct_proxy`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProxyError;
use crate::protocol::command::Command;

/// Frames the proxy can't parse past this size are rejected rather than
/// buffered unbounded; a hostile or buggy peer shouldn't be able to make
/// the proxy allocate without limit just by sending a huge length prefix.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Frame {
    pub command: Command,
    pub payload: Option<Bytes>,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame {
            command,
            payload: None,
        }
    }

    pub fn with_payload(command: Command, payload: Bytes) -> Self {
        Frame {
            command,
            payload: Some(payload),
        }
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Frame::new(command)
    }
}

#[derive(Default)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let total_size = u32::from_be_bytes(src[0..4].try_into().unwrap());
        if total_size > self.max_frame_size {
            return Err(ProxyError::protocol(format!(
                "frame of {total_size} bytes exceeds max {}",
                self.max_frame_size
            )));
        }
        let frame_len = 4 + total_size as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut frame_buf = src.split_to(frame_len);
        frame_buf.advance(4); // totalSize
        if frame_buf.remaining() < 4 {
            return Err(ProxyError::protocol("truncated commandSize"));
        }
        let command_size = frame_buf.get_u32() as usize;
        if frame_buf.remaining() < command_size {
            return Err(ProxyError::protocol("commandSize exceeds frame"));
        }
        let command_bytes = frame_buf.split_to(command_size).freeze();
        let command = Command::decode(command_bytes)?;
        let payload = if frame_buf.has_remaining() {
            Some(frame_buf.freeze())
        } else {
            None
        };

        Ok(Some(Frame { command, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), ProxyError> {
        let mut command_buf = BytesMut::new();
        item.command.encode(&mut command_buf);
        let command_size = command_buf.len() as u32;
        let payload_len = item.payload.as_ref().map(|p| p.len()).unwrap_or(0);
        let total_size = 4 + command_size + payload_len as u32;

        if total_size > self.max_frame_size {
            return Err(ProxyError::protocol(format!(
                "outgoing frame of {total_size} bytes exceeds max {}",
                self.max_frame_size
            )));
        }

        dst.reserve(4 + total_size as usize);
        dst.put_u32(total_size);
        dst.put_u32(command_size);
        dst.put_slice(&command_buf);
        if let Some(payload) = &item.payload {
            dst.put_slice(payload);
        }
        Ok(())
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = ProxyError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), ProxyError> {
        Encoder::<Frame>::encode(self, Frame::new(item), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::Command;

    #[test]
    fn frame_roundtrips_through_codec() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::new(Command::Ping);
        Encoder::<Frame>::encode(&mut codec, frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().expect("some frame");
        assert!(matches!(decoded.command, Command::Ping));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_returns_none() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let mut full = BytesMut::new();
        Encoder::<Frame>::encode(&mut codec, Frame::new(Command::Ping), &mut full).unwrap();
        buf.extend_from_slice(&full[..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new();
        codec.max_frame_size = 8;
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.put_u32(4);
        buf.put_slice(&[0u8; 4]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
