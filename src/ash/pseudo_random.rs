//! DATA frame payloads are XORed with a fixed pseudo-random sequence before
//! transmission so that long runs of identical bytes do not starve the UART
//! of transitions. The mask is its own inverse, so the same routine serves
//! both directions.

/// XOR `buf` in place with the ASH pseudo-random sequence, starting from the
/// 0x42 seed. The register shifts right each byte; when the low bit is set
/// the shifted value is XORed with 0xB8.
pub fn mask_payload(buf: &mut [u8]) {
    let mut reg: u8 = 0x42;
    for item in buf {
        *item ^= reg;
        reg = (reg >> 1) ^ ((reg & 0x01) * 0xB8);
    }
}

#[cfg(test)]
mod tests {
    use super::mask_payload;

    #[test]
    fn it_computes_the_correct_sequence() {
        let mut buf = [0u8; 5];
        mask_payload(&mut buf);
        assert_eq!(buf, [0x42, 0x21, 0xA8, 0x54, 0x2A]);
    }

    #[test]
    fn it_is_self_inverse() {
        let mut buf = [0x00, 0x80, 0x00, 0x08, 0x02, 0x80, 0x67];
        let original = buf;
        mask_payload(&mut buf);
        assert_ne!(buf, original);
        mask_payload(&mut buf);
        assert_eq!(buf, original);
    }
}
