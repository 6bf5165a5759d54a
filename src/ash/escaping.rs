use bytes::{BufMut, BytesMut};

use super::constants::{ESCAPE_BYTE, RESERVED_BYTES};

/// Stuff reserved bytes: each byte in the reserved set is replaced with an
/// Escape byte followed by the original byte XOR 0x20.
pub fn stuff_reserved_bytes(frame: &[u8], buf: &mut BytesMut) {
    for &byte in frame {
        if RESERVED_BYTES.contains(&byte) {
            buf.put_u8(ESCAPE_BYTE);
            buf.put_u8(byte ^ 0x20);
        } else {
            buf.put_u8(byte);
        }
    }
}

/// Undo the stuffing applied by [`stuff_reserved_bytes`]. The byte following
/// an Escape byte is restored by XOR 0x20; everything else passes through.
pub fn unstuff_reserved_bytes(stuffed: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(stuffed.len());
    let mut escaped = false;
    for &byte in stuffed {
        if escaped {
            out.put_u8(byte ^ 0x20);
            escaped = false;
        } else if byte == ESCAPE_BYTE {
            escaped = true;
        } else {
            out.put_u8(byte);
        }
    }
    out
}
