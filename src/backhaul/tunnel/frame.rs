use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::backhaul::tunnel::protocol::ProtocolError;

/// Size of the big-endian length prefix.
pub const LEN_PREFIX: usize = 4;
/// Type byte + stream id; counted by the length prefix.
pub const FRAME_HEADER: usize = 5;
/// Upper bound on a single frame (type + stream id + payload).
pub const MAX_FRAME_LEN: usize = 16 << 20; // 16 MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Auth = 0,
    TcpOpen = 1,
    TcpData = 2,
    TcpClose = 3,
    UdpOpen = 4,
    UdpData = 5,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(FrameType::Auth),
            1 => Ok(FrameType::TcpOpen),
            2 => Ok(FrameType::TcpData),
            3 => Ok(FrameType::TcpClose),
            4 => Ok(FrameType::UdpOpen),
            5 => Ok(FrameType::UdpData),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, stream_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            stream_id,
            payload: payload.into(),
        }
    }

    /// AUTH always travels on the connection-level id 0.
    pub fn auth(payload: Bytes) -> Self {
        Self::new(FrameType::Auth, 0, payload)
    }

    pub fn tcp_open(id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::TcpOpen, id, payload)
    }

    pub fn tcp_data(id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::TcpData, id, payload)
    }

    pub fn tcp_close(id: u32) -> Self {
        Self::new(FrameType::TcpClose, id, Bytes::new())
    }

    pub fn udp_open(id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::UdpOpen, id, payload)
    }

    pub fn udp_data(id: u32, payload: Bytes) -> Self {
        Self::new(FrameType::UdpData, id, payload)
    }

    pub fn wire_len(&self) -> usize {
        LEN_PREFIX + FRAME_HEADER + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// ```text
/// ┌──────────────┬──────────┬─────────────┬───────────┐
/// │ length (4B)  │ type (1B)│ stream (4B) │ payload   │
/// │ big-endian   │          │ big-endian  │           │
/// └──────────────┴──────────┴─────────────┴───────────┘
/// length = 5 + payload.len()
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = FRAME_HEADER + frame.payload.len();
    if body > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(body));
    }
    dst.reserve(frame.wire_len());
    dst.put_u32(body as u32);
    dst.put_u8(frame.kind as u8);
    dst.put_u32(frame.stream_id);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` until a whole frame is buffered; the consumed bytes are
/// removed from `src` only once a frame is complete.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }

    let mut len_bytes = [0u8; LEN_PREFIX];
    len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
    let len = u32::from_be_bytes(len_bytes);
    if (len as usize) < FRAME_HEADER {
        return Err(ProtocolError::ShortFrame(len));
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let total = LEN_PREFIX + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(LEN_PREFIX);
    let kind = FrameType::try_from(src.get_u8())?;
    let stream_id = src.get_u32();
    let payload = src.split_to(len - FRAME_HEADER).freeze();
    Ok(Some(Frame {
        kind,
        stream_id,
        payload,
    }))
}

/// `tokio_util` adapter so a control socket can be driven as a
/// `FramedRead`/`FramedWrite` pair; the framed reader owns the accumulation
/// buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        decode_frame(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_frame(&frame, dst)
    }
}
