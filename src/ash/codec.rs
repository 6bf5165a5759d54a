use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::{
    checksum::frame_checksum,
    constants::{CANCEL_BYTE, FLAG_BYTE, SUB_BYTE, XOFF_BYTE, XON_BYTE},
    error::{Error, Result},
    escaping::unstuff_reserved_bytes,
    frame::Frame,
};

/// Splits the raw byte stream into ASH frames.
///
/// Bytes accumulate into a segment until a Flag byte terminates it. A Cancel
/// byte throws away the partial segment, a Substitute byte additionally
/// discards everything up to the next Flag, and XON/XOFF flow-control hints
/// are skipped. Complete segments are unstuffed and checksum-verified before
/// the control byte is matched against the frame taxonomy.
///
/// Malformed frames are soft failures: the decoder yields them as an `Err`
/// item so the transport can log and move on without tearing the link down.
#[derive(Debug, Default)]
pub struct AshCodec {
    segment: BytesMut,
    dropping: bool,
}

impl AshCodec {
    /// Forget any partial input, e.g. across a link reset.
    pub fn reset(&mut self) {
        self.segment.clear();
        self.dropping = false;
    }

    #[cfg(test)]
    fn is_dropping(&self) -> bool {
        self.dropping
    }

    fn finish_segment(&mut self) -> Result<Frame> {
        let stuffed = self.segment.split();
        let unstuffed = unstuff_reserved_bytes(&stuffed);

        // Control byte plus the two checksum bytes is the minimum frame.
        if unstuffed.len() < 3 {
            return Err(Error::InvalidDataField);
        }

        let (body, checksum) = unstuffed.split_at(unstuffed.len() - 2);
        if frame_checksum(body) != (&checksum[..]).get_u16() {
            return Err(Error::InvalidChecksum);
        }

        Frame::parse(body)
    }
}

impl Decoder for AshCodec {
    type Item = Result<Frame>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        while src.has_remaining() {
            let byte = src.get_u8();

            if self.dropping {
                if byte == FLAG_BYTE {
                    trace!("Frame boundary found, resuming reception");
                    self.dropping = false;
                    self.segment.clear();
                }
                continue;
            }

            match byte {
                FLAG_BYTE => {
                    // A Flag with nothing buffered is a repeated terminator.
                    if self.segment.is_empty() {
                        continue;
                    }
                    match self.finish_segment() {
                        Ok(frame) => return Ok(Some(Ok(frame))),
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed frame");
                            return Ok(Some(Err(e)));
                        }
                    }
                }
                CANCEL_BYTE => {
                    trace!(discarded = self.segment.len(), "Cancel byte received");
                    self.segment.clear();
                }
                SUB_BYTE => {
                    trace!("Substitute byte received, discarding until next flag");
                    self.segment.clear();
                    self.dropping = true;
                }
                XON_BYTE | XOFF_BYTE => {
                    trace!(byte, "Ignoring flow control byte");
                }
                other => self.segment.extend_from_slice(&[other]),
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for AshCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        item.serialize(dst);
        Ok(())
    }
}
