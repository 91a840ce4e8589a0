// crc.rs - 32-bit checksum over whole map files.
// Delegates to the `crc` crate (CRC-32/ISO-HDLC, the zlib polynomial).

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC_CALC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Checksum an entire block of data.
pub fn crc_block(data: &[u8]) -> u32 {
    CRC_CALC.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_check_value() {
        // standard CRC-32 check string
        assert_eq!(crc_block(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_crc_discriminates() {
        assert_ne!(crc_block(b"maps/one.bsp"), crc_block(b"maps/two.bsp"));
    }
}
