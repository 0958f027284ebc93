//! Exchange Wire Protocol framing.
//!
//! Frame layout: `[0xCF][varint length][command][payload]`, where `length`
//! counts the command byte plus the payload.
//!
//! | command     | byte | payload                                       |
//! |-------------|------|-----------------------------------------------|
//! | REGISTER    | 0x01 | varint ack id, ANSI destination id            |
//! | UNREGISTER  | 0x02 | varint ack id, ANSI destination id            |
//! | SUBSCRIBE   | 0x03 | varint ack id, ANSI destination id            |
//! | PUBLISH     | 0x04 | varint ack id, ANSI destination id, raw bytes |
//! | ACK         | 0x05 | varint ack id, optional error-code byte       |
//!
//! [`FrameDecoder`] reassembles frames from an arbitrary byte stream: a read
//! may hold several frames or a fraction of one.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    ack::AckId,
    packet::{Packet, PacketError, PacketWriter},
    varint,
};

/// First byte of every frame.
pub const FRAME_HEADER: u8 = 0xCF;

/// Upper bound on the length field, command byte included.
pub const MAX_FRAME_LENGTH: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad frame header byte {0:#04x}")]
    BadHeader(u8),

    #[error("frame length {0} exceeds the {MAX_FRAME_LENGTH} byte limit")]
    FrameTooLarge(u64),

    #[error("frame length must include the command byte")]
    EmptyFrame,

    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),

    #[error("unexpected {0:?} frame")]
    UnexpectedCommand(CommandCode),

    #[error("{trailing} trailing bytes after {command:?} payload")]
    TrailingBytes { command: CommandCode, trailing: usize },

    #[error("malformed payload: {0}")]
    Malformed(#[from] PacketError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    Register = 0x01,
    Unregister = 0x02,
    Subscribe = 0x03,
    Publish = 0x04,
    Ack = 0x05,
}

impl TryFrom<u8> for CommandCode {
    type Error = WireError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0x01 => Ok(CommandCode::Register),
            0x02 => Ok(CommandCode::Unregister),
            0x03 => Ok(CommandCode::Subscribe),
            0x04 => Ok(CommandCode::Publish),
            0x05 => Ok(CommandCode::Ack),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Register { ack: AckId, id: String },
    Unregister { ack: AckId, id: String },
    Subscribe { ack: AckId, id: String },
    Publish { ack: AckId, id: String, payload: Bytes },
    Ack { ack: AckId, error: Option<u8> },
}

impl Frame {
    pub fn command(&self) -> CommandCode {
        match self {
            Frame::Register { .. } => CommandCode::Register,
            Frame::Unregister { .. } => CommandCode::Unregister,
            Frame::Subscribe { .. } => CommandCode::Subscribe,
            Frame::Publish { .. } => CommandCode::Publish,
            Frame::Ack { .. } => CommandCode::Ack,
        }
    }

    pub fn ack_id(&self) -> AckId {
        match self {
            Frame::Register { ack, .. }
            | Frame::Unregister { ack, .. }
            | Frame::Subscribe { ack, .. }
            | Frame::Publish { ack, .. }
            | Frame::Ack { ack, .. } => *ack,
        }
    }

    /// Serializes the frame, header and length included.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut body = PacketWriter::with_capacity(self.body_hint());
        body.write_u8(self.command() as u8);
        match self {
            Frame::Register { ack, id }
            | Frame::Unregister { ack, id }
            | Frame::Subscribe { ack, id } => {
                body.write_uint(*ack);
                body.write_ansi_string(id)?;
            }
            Frame::Publish { ack, id, payload } => {
                body.write_uint(*ack);
                body.write_ansi_string(id)?;
                body.write_raw(payload);
            }
            Frame::Ack { ack, error } => {
                body.write_uint(*ack);
                if let Some(code) = error {
                    body.write_u8(*code);
                }
            }
        }

        let body = body.finish();
        let length = body.len() as u64;
        if length > MAX_FRAME_LENGTH {
            return Err(WireError::FrameTooLarge(length));
        }

        let mut out = BytesMut::with_capacity(1 + varint::encoded_len(length) + body.len());
        out.put_u8(FRAME_HEADER);
        varint::put_u64(&mut out, length);
        out.put_slice(body.as_bytes());
        Ok(out.freeze())
    }

    /// Parses the bytes that follow the length field.
    fn decode(body: Bytes) -> Result<Self, WireError> {
        let mut packet = Packet::from_bytes(body);
        let command = CommandCode::try_from(packet.read_u8()?)?;
        let ack = packet.read_uint()?;

        let frame = match command {
            CommandCode::Register => Frame::Register {
                ack,
                id: packet.read_ansi_string()?,
            },
            CommandCode::Unregister => Frame::Unregister {
                ack,
                id: packet.read_ansi_string()?,
            },
            CommandCode::Subscribe => Frame::Subscribe {
                ack,
                id: packet.read_ansi_string()?,
            },
            CommandCode::Publish => {
                let id = packet.read_ansi_string()?;
                let payload = packet.read_remaining();
                Frame::Publish { ack, id, payload }
            }
            CommandCode::Ack => {
                let error = if packet.is_exhausted() {
                    None
                } else {
                    Some(packet.read_u8()?)
                };
                Frame::Ack { ack, error }
            }
        };

        if !packet.is_exhausted() {
            return Err(WireError::TrailingBytes {
                command,
                trailing: packet.remaining(),
            });
        }
        Ok(frame)
    }

    fn body_hint(&self) -> usize {
        let id_len = match self {
            Frame::Register { id, .. }
            | Frame::Unregister { id, .. }
            | Frame::Subscribe { id, .. } => id.len(),
            Frame::Publish { id, payload, .. } => id.len() + payload.len(),
            Frame::Ack { .. } => 0,
        };
        1 + 2 * varint::MAX_LEN + id_len + 1
    }
}

/// Incremental decoder for a stream of frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `data` and extracts every frame that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, WireError> {
        self.pending.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_next()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Extracts one frame if a complete one is buffered.
    pub fn try_next(&mut self) -> Result<Option<Frame>, WireError> {
        let Some(&header) = self.pending.first() else {
            return Ok(None);
        };
        if header != FRAME_HEADER {
            return Err(WireError::BadHeader(header));
        }

        let Some((length, length_len)) = varint::decode_u64(&self.pending[1..]) else {
            return Ok(None);
        };
        if length == 0 {
            return Err(WireError::EmptyFrame);
        }
        if length > MAX_FRAME_LENGTH {
            return Err(WireError::FrameTooLarge(length));
        }

        let body_start = 1 + length_len;
        let frame_len = body_start + length as usize;
        if self.pending.len() < frame_len {
            return Ok(None);
        }

        let mut frame = self.pending.split_to(frame_len).freeze();
        let body = frame.split_off(body_start);
        Frame::decode(body).map(Some)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
