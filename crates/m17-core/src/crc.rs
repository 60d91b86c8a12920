//! M17 CRC-16.
//!
//! Polynomial 0x5935, initial value 0xFFFF, MSB-first, no final xor.
//! Used over whole stream frames (minus the trailing CRC), and separately
//! over the LSF and payload portions of packet-mode datagrams.

pub const POLY: u16 = 0x5935;
pub const INIT: u16 = 0xFFFF;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc: u16 = 0;
        let mut c: u16 = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            if (crc ^ c) & 0x8000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
            c <<= 1;
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC of `data`.
pub fn crc(data: &[u8]) -> u16 {
    data.iter().fold(INIT, |crc, &b| {
        (crc << 8) ^ TABLE[(((crc >> 8) ^ b as u16) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_init_value() {
        assert_eq!(crc(&[]), 0xFFFF);
    }

    #[test]
    fn reference_vectors() {
        assert_eq!(crc(b"A"), 0x206E);
        assert_eq!(crc(b"123456789"), 0x772B);
        let all: Vec<u8> = (0..=255u8).collect();
        assert_eq!(crc(&all), 0x1C31);
    }

    #[test]
    fn deterministic_and_sensitive_to_single_bit() {
        let frame: Vec<u8> = (0..52u8).map(|b| b.wrapping_mul(37)).collect();
        let reference = crc(&frame);
        assert_eq!(crc(&frame), reference);

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut flipped = frame.clone();
                flipped[byte] ^= 1 << bit;
                assert_ne!(crc(&flipped), reference, "flip at {byte}:{bit} went unnoticed");
            }
        }
    }

    #[test]
    fn table_is_msb_first() {
        assert_eq!(TABLE[0], 0);
        assert_eq!(TABLE[1], POLY);
        assert_eq!(TABLE[0x80], {
            // 0x80 << 8 = 0x8000 shifts straight out on the first step
            let mut crc: u16 = POLY;
            for _ in 0..7 {
                crc = if crc & 0x8000 != 0 { (crc << 1) ^ POLY } else { crc << 1 };
            }
            crc
        });
    }
}
