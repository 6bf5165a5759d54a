use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bits::{
        bits,
        complete::{bool, tag, take},
    },
    error::Error as NomError,
    sequence::{preceded, tuple},
    IResult,
};

use super::{
    checksum::frame_checksum,
    constants::FLAG_BYTE,
    error::{Error, Result},
    escaping::stuff_reserved_bytes,
    pseudo_random::mask_payload,
    types::FrameNumber,
};

type ParserResult<'a, T> = IResult<&'a [u8], T>;

/// The six ASH frame types, tagged by the masked control byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        frm_num: FrameNumber,
        re_tx: bool,
        ack_num: FrameNumber,
        body: Bytes,
    },
    Ack {
        n_rdy: bool,
        ack_num: FrameNumber,
    },
    Nak {
        n_rdy: bool,
        ack_num: FrameNumber,
    },
    Rst,
    RstAck {
        version: u8,
        code: u8,
    },
    Error {
        version: u8,
        code: u8,
    },
}

/// `(mask, value)` pairs for each frame type, tried in order against the
/// control byte of a received frame.
const DATA_MASK: (u8, u8) = (0b1000_0000, 0b0000_0000);
const ACK_MASK: (u8, u8) = (0b1110_0000, 0b1000_0000);
const NAK_MASK: (u8, u8) = (0b1110_0000, 0b1010_0000);
const RST_MASK: (u8, u8) = (0b1111_1111, 0b1100_0000);
const RST_ACK_MASK: (u8, u8) = (0b1111_1111, 0b1100_0001);
const ERROR_MASK: (u8, u8) = (0b1111_1111, 0b1100_0010);

const MAX_DATA_LEN: usize = 128;

fn matches(control: u8, (mask, value): (u8, u8)) -> bool {
    control & mask == value
}

fn data_control_byte(input: &[u8]) -> ParserResult<(u8, bool, u8)> {
    bits::<_, _, NomError<(&[u8], usize)>, _, _>(preceded(
        tag(0, 1usize),
        tuple((take(3usize), bool, take(3usize))),
    ))(input)
}

fn ack_nak_control_byte(pattern: u8) -> impl Fn(&[u8]) -> ParserResult<(bool, bool, u8)> {
    move |input: &[u8]| {
        bits::<_, _, NomError<(&[u8], usize)>, _, _>(preceded(
            tag(pattern, 3usize),
            tuple((bool, bool, take(3usize))),
        ))(input)
    }
}

impl Frame {
    pub fn data(frm_num: FrameNumber, re_tx: bool, ack_num: FrameNumber, body: Bytes) -> Frame {
        Frame::Data {
            frm_num,
            re_tx,
            ack_num,
            body,
        }
    }

    pub fn ack(n_rdy: bool, ack_num: FrameNumber) -> Frame {
        Frame::Ack { n_rdy, ack_num }
    }

    pub fn nak(n_rdy: bool, ack_num: FrameNumber) -> Frame {
        Frame::Nak { n_rdy, ack_num }
    }

    pub fn rst_ack(version: u8, code: u8) -> Frame {
        Frame::RstAck { version, code }
    }

    pub fn error(version: u8, code: u8) -> Frame {
        Frame::Error { version, code }
    }

    /// Parse an unstuffed, checksum-stripped frame segment. The control byte
    /// is matched against each frame type's `(mask, value)` pair in order;
    /// a control byte that matches none of them is an unknown frame.
    pub fn parse(segment: &[u8]) -> Result<Frame> {
        let control = *segment.first().ok_or(Error::Incomplete)?;

        if matches(control, DATA_MASK) {
            let (body, (frm_num, re_tx, ack_num)) =
                data_control_byte(segment).map_err(|_| Error::InvalidDataField)?;
            if body.is_empty() || body.len() > MAX_DATA_LEN {
                return Err(Error::InvalidDataField);
            }
            let mut data = BytesMut::from(body);
            mask_payload(&mut data);
            Ok(Frame::Data {
                frm_num: FrameNumber::new_truncate(frm_num),
                re_tx,
                ack_num: FrameNumber::new_truncate(ack_num),
                body: data.freeze(),
            })
        } else if matches(control, ACK_MASK) {
            let (rest, (_res, n_rdy, ack_num)) =
                ack_nak_control_byte(0b100)(segment).map_err(|_| Error::InvalidDataField)?;
            if !rest.is_empty() {
                return Err(Error::InvalidDataField);
            }
            Ok(Frame::Ack {
                n_rdy,
                ack_num: FrameNumber::new_truncate(ack_num),
            })
        } else if matches(control, NAK_MASK) {
            let (rest, (_res, n_rdy, ack_num)) =
                ack_nak_control_byte(0b101)(segment).map_err(|_| Error::InvalidDataField)?;
            if !rest.is_empty() {
                return Err(Error::InvalidDataField);
            }
            Ok(Frame::Nak {
                n_rdy,
                ack_num: FrameNumber::new_truncate(ack_num),
            })
        } else if matches(control, RST_MASK) {
            if segment.len() != 1 {
                return Err(Error::InvalidDataField);
            }
            Ok(Frame::Rst)
        } else if matches(control, RST_ACK_MASK) {
            match segment {
                [_, version, code] => Ok(Frame::RstAck {
                    version: *version,
                    code: *code,
                }),
                _ => Err(Error::InvalidDataField),
            }
        } else if matches(control, ERROR_MASK) {
            match segment {
                [_, version, code] => Ok(Frame::Error {
                    version: *version,
                    code: *code,
                }),
                _ => Err(Error::InvalidDataField),
            }
        } else {
            Err(Error::UnknownFrame(control))
        }
    }

    pub fn control_byte(&self) -> u8 {
        match self {
            Frame::Data {
                frm_num,
                re_tx,
                ack_num,
                ..
            } => (**frm_num << 4) | ((*re_tx as u8) << 3) | **ack_num,
            Frame::Ack { n_rdy, ack_num } => 0x80 | ((*n_rdy as u8) << 3) | **ack_num,
            Frame::Nak { n_rdy, ack_num } => 0xA0 | ((*n_rdy as u8) << 3) | **ack_num,
            Frame::Rst => 0xC0,
            Frame::RstAck { .. } => 0xC1,
            Frame::Error { .. } => 0xC2,
        }
    }

    pub fn data_len(&self) -> usize {
        match self {
            Frame::Data { body, .. } => body.len(),
            Frame::RstAck { .. } | Frame::Error { .. } => 2,
            _ => 0,
        }
    }

    fn serialize_data(&self, buf: &mut BytesMut) {
        match self {
            Frame::Data { body, .. } => {
                let start = buf.len();
                buf.put_slice(body);
                mask_payload(&mut buf[start..]);
            }
            Frame::RstAck { version, code } | Frame::Error { version, code } => {
                buf.put_u8(*version);
                buf.put_u8(*code);
            }
            _ => {}
        }
    }

    /// Serialize into the on-wire representation: control byte, data field,
    /// big-endian CRC, all byte-stuffed and terminated with a Flag byte.
    pub fn serialize(&self, buf: &mut BytesMut) {
        let mut raw = BytesMut::with_capacity(self.data_len() + 3);
        raw.put_u8(self.control_byte());
        self.serialize_data(&mut raw);
        let checksum = frame_checksum(&raw);
        raw.put_u16(checksum);
        stuff_reserved_bytes(&raw, buf);
        buf.put_u8(FLAG_BYTE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_a_valid_data_frame() {
        // frm_num 2, ack_num 5, payload 00 00 00 02 masked on the wire
        let segment = [0x25, 0x42, 0x21, 0xA8, 0x56];
        let frame = Frame::parse(&segment).unwrap();
        assert!(matches!(
            frame,
            Frame::Data { frm_num, re_tx, ack_num, ref body }
                if *frm_num == 2 && !re_tx && *ack_num == 5
                    && body.as_ref() == [0x00, 0x00, 0x00, 0x02]
        ));
    }

    #[test]
    fn it_parses_a_retransmitted_data_frame() {
        let segment = [0x2D, 0x42, 0x21, 0xA8, 0x56];
        let frame = Frame::parse(&segment).unwrap();
        assert!(matches!(frame, Frame::Data { re_tx: true, .. }));
    }

    #[test]
    fn it_parses_valid_ack_frames() {
        let frame = Frame::parse(&[0x81]).unwrap();
        assert!(matches!(frame, Frame::Ack { n_rdy, ack_num } if !n_rdy && *ack_num == 1));

        let frame = Frame::parse(&[0x8E]).unwrap();
        assert!(matches!(frame, Frame::Ack { n_rdy, ack_num } if n_rdy && *ack_num == 6));
    }

    #[test]
    fn it_parses_a_valid_nak_frame() {
        let frame = Frame::parse(&[0xA6]).unwrap();
        assert!(matches!(frame, Frame::Nak { n_rdy, ack_num } if !n_rdy && *ack_num == 6));
    }

    #[test]
    fn it_parses_a_valid_rst_frame() {
        assert!(matches!(Frame::parse(&[0xC0]).unwrap(), Frame::Rst));
    }

    #[test]
    fn it_parses_a_valid_rst_ack_frame() {
        let frame = Frame::parse(&[0xC1, 0x02, 0x0B]).unwrap();
        assert!(matches!(frame, Frame::RstAck { version, code } if version == 2 && code == 0x0B));
    }

    #[test]
    fn it_parses_a_valid_error_frame() {
        let frame = Frame::parse(&[0xC2, 0x02, 0x51]).unwrap();
        assert!(matches!(frame, Frame::Error { version, code } if version == 2 && code == 0x51));
    }

    #[test]
    fn it_rejects_an_unknown_control_byte() {
        let err = Frame::parse(&[0xFF]).unwrap_err();
        assert_eq!(err, Error::UnknownFrame(0xFF));
    }

    #[test]
    fn it_rejects_an_ack_frame_with_trailing_bytes() {
        let err = Frame::parse(&[0x81, 0x00]).unwrap_err();
        assert_eq!(err, Error::InvalidDataField);
    }

    #[test]
    fn it_rejects_an_oversized_data_frame() {
        let mut segment = vec![0x25u8];
        segment.extend(std::iter::repeat(0).take(129));
        let err = Frame::parse(&segment).unwrap_err();
        assert_eq!(err, Error::InvalidDataField);
    }

    #[test]
    fn it_serializes_control_bytes_correctly() {
        let data = Frame::data(
            FrameNumber::new_truncate(2),
            false,
            FrameNumber::new_truncate(5),
            Bytes::new(),
        );
        assert_eq!(data.control_byte(), 0x25);

        assert_eq!(Frame::ack(true, FrameNumber::new_truncate(6)).control_byte(), 0x8E);
        assert_eq!(Frame::nak(true, FrameNumber::new_truncate(5)).control_byte(), 0xAD);
        assert_eq!(Frame::Rst.control_byte(), 0xC0);
        assert_eq!(Frame::rst_ack(0x02, 0x02).control_byte(), 0xC1);
        assert_eq!(Frame::error(0x02, 0x52).control_byte(), 0xC2);
    }

    #[test]
    fn it_serializes_a_rst_frame_onto_the_wire() {
        let mut buf = BytesMut::new();
        Frame::Rst.serialize(&mut buf);
        assert_eq!(buf.as_ref(), [0xC0, 0x38, 0xBC, 0x7E]);
    }

    #[test]
    fn it_masks_the_data_field_during_serialization() {
        let frame = Frame::data(
            FrameNumber::new_truncate(2),
            false,
            FrameNumber::new_truncate(5),
            Bytes::from_static(&[0x00, 0x00, 0x00, 0x02]),
        );
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        // control, masked payload, CRC, flag
        assert_eq!(
            buf.as_ref(),
            [0x25, 0x42, 0x21, 0xA8, 0x56, 0xA6, 0x09, 0x7E]
        );
    }

    #[test]
    fn it_stuffs_reserved_bytes_during_serialization() {
        // ack_num 3 gives control byte 0xA0 | 0x08 | 0x05.. pick NAK with
        // n_rdy=1 ack=5 -> 0xAD, no stuffing; instead craft a DATA frame
        // whose masked payload contains a reserved byte.
        let frame = Frame::data(
            FrameNumber::zero(),
            false,
            FrameNumber::zero(),
            // 0x42 ^ 0x3C = 0x7E, the flag byte
            Bytes::from_static(&[0x3C, 0x00, 0x00]),
        );
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        assert_eq!(buf[0], 0x00);
        assert_eq!(buf[1], 0x7D);
        assert_eq!(buf[2], 0x5E);
        assert_eq!(*buf.last().unwrap(), 0x7E);
    }

    #[test]
    fn it_round_trips_every_frame_type() {
        use super::super::{checksum::frame_checksum, escaping::unstuff_reserved_bytes};

        let frames = [
            Frame::data(
                FrameNumber::new_truncate(3),
                true,
                FrameNumber::new_truncate(6),
                Bytes::from_static(&[0x00, 0x80, 0x00, 0x08, 0x02, 0x80, 0x67]),
            ),
            Frame::ack(false, FrameNumber::new_truncate(1)),
            Frame::nak(true, FrameNumber::new_truncate(7)),
            Frame::Rst,
            Frame::rst_ack(0x02, 0x0B),
            Frame::error(0x02, 0x51),
        ];

        for frame in frames {
            let mut wire = BytesMut::new();
            frame.serialize(&mut wire);
            assert_eq!(*wire.last().unwrap(), 0x7E);

            let segment = unstuff_reserved_bytes(&wire[..wire.len() - 1]);
            let crc = frame_checksum(&segment[..segment.len() - 2]);
            assert_eq!(
                crc.to_be_bytes(),
                segment[segment.len() - 2..],
                "checksum mismatch for {:?}",
                frame
            );

            let parsed = Frame::parse(&segment[..segment.len() - 2]).unwrap();
            assert_eq!(parsed, frame);
        }
    }
}
