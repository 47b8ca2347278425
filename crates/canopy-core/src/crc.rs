//! Reflected table-driven CRC-32 (ISO-HDLC variant)
//!
//! Used once per session to checksum the compressed tree descriptor; the
//! instrument echoes the same value back through the ADMIN:CRC32 node to
//! confirm both sides saw identical tree bytes.

const POLYNOMIAL: u32 = 0x04C1_1DB7;
const INITIAL_REMAINDER: u32 = 0xFFFF_FFFF;
const FINAL_XOR: u32 = 0xFFFF_FFFF;

/// CRC-32 engine with a precomputed 256-entry table.
pub struct Crc32 {
    table: [u32; 256],
}

impl Crc32 {
    /// Build the lookup table (MSB-first construction).
    pub fn new() -> Self {
        let mut table = [0u32; 256];
        for (dividend, entry) in table.iter_mut().enumerate() {
            let mut remainder = (dividend as u32) << 24;
            for _ in 0..8 {
                remainder = if remainder & 0x8000_0000 != 0 {
                    (remainder << 1) ^ POLYNOMIAL
                } else {
                    remainder << 1
                };
            }
            *entry = remainder;
        }
        Self { table }
    }

    /// Checksum a byte slice, reflecting each input byte and the final
    /// remainder. Produces the standard CRC-32 value bit-for-bit.
    pub fn checksum(&self, message: &[u8]) -> u32 {
        let mut remainder = INITIAL_REMAINDER;
        for &byte in message {
            let index = (byte.reverse_bits() as u32) ^ (remainder >> 24);
            remainder = self.table[index as usize] ^ (remainder << 8);
        }
        remainder.reverse_bits() ^ FINAL_XOR
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}
