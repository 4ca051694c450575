//! CRC-16 checksum validation for ERT packets

/// BCH generator polynomial used by SCM packets
pub const SCM_POLY: u16 = 0x6F63;

/// CCITT polynomial used by IDM and R900 packets
pub const CCITT_POLY: u16 = 0x1021;

/// CCITT initial register value for IDM packets
pub const CCITT_INIT: u16 = 0xFFFF;

/// Compute a CRC-16 over `data`, MSB first, no reflection, no final XOR.
///
/// A packet that carries its checksum big-endian in the last two bytes of
/// the checked region computes to zero when valid.
pub fn crc16(poly: u16, init: u16, data: &[u8]) -> u16 {
    let mut crc = init;

    for &byte in data {
        crc ^= (byte as u16) << 8;

        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ poly;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}
