use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{Error, Result};

/// Highest protocol version this driver carries a command table for.
pub const MAX_PROTOCOL_VERSION: u8 = 8;

/// A decoded EZSP frame envelope, independent of protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub seq: u8,
    pub frame_control: u8,
    pub command_id: u16,
    pub body: Bytes,
}

/// The version-specific wrapping around an EZSP command body.
///
/// Each wire format is its own strategy; they all share the command-table
/// shape, so swapping protocol versions after negotiation only swaps this
/// codec and the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeCodec {
    /// `seq | frame_ctrl | cmd_id:u8`
    V4,
    /// `seq | frame_ctrl | 0xFF | 0x00 | cmd_id:u8` (versions 5 through 7)
    V5,
    /// `seq | frame_ctrl | ext_frame_ctrl | cmd_id:u16 LE` (version 8 and up)
    V8,
}

impl EnvelopeCodec {
    /// The codec for a negotiated protocol version, if it is one we know.
    pub fn for_protocol_version(version: u8) -> Option<EnvelopeCodec> {
        match version {
            4 => Some(EnvelopeCodec::V4),
            5..=7 => Some(EnvelopeCodec::V5),
            8..=MAX_PROTOCOL_VERSION => Some(EnvelopeCodec::V8),
            _ => None,
        }
    }

    pub fn encode(&self, seq: u8, command_id: u16, body: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(body.len() + 5);
        buf.put_u8(seq);
        buf.put_u8(0x00);
        match self {
            EnvelopeCodec::V4 => {
                buf.put_u8(narrow_command_id(command_id)?);
            }
            EnvelopeCodec::V5 => {
                buf.put_u8(0xFF);
                buf.put_u8(0x00);
                buf.put_u8(narrow_command_id(command_id)?);
            }
            EnvelopeCodec::V8 => {
                buf.put_u8(0x00);
                buf.put_u16_le(command_id);
            }
        }
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    pub fn decode(&self, mut frame: Bytes) -> Result<Envelope> {
        if frame.len() < self.header_len() {
            return Err(Error::Decode("frame shorter than its envelope"));
        }
        let seq = frame.get_u8();
        let frame_control = frame.get_u8();
        let command_id = match self {
            EnvelopeCodec::V4 => frame.get_u8() as u16,
            EnvelopeCodec::V5 => {
                let legacy = frame.get_u8();
                let ext = frame.get_u8();
                if legacy != 0xFF || ext != 0x00 {
                    return Err(Error::Decode("bad legacy frame id escape"));
                }
                frame.get_u8() as u16
            }
            EnvelopeCodec::V8 => {
                let _ext_frame_control = frame.get_u8();
                frame.get_u16_le()
            }
        };
        Ok(Envelope {
            seq,
            frame_control,
            command_id,
            body: frame,
        })
    }

    fn header_len(&self) -> usize {
        match self {
            EnvelopeCodec::V4 => 3,
            EnvelopeCodec::V5 => 5,
            EnvelopeCodec::V8 => 5,
        }
    }
}

fn narrow_command_id(command_id: u16) -> Result<u8> {
    command_id
        .try_into()
        .map_err(|_| Error::Encode("command id does not fit a legacy frame"))
}
