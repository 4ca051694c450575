//! IDM - Interval Data Message parser
//!
//! 92-byte packet opened by the 0x555516A3 sync word. Carries the ERT
//! serial number and type plus interval consumption data, closed by a
//! CRC-16/CCITT checksum over bytes 4..92.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::crc::{crc16, CCITT_INIT, CCITT_POLY};
use super::{field, Decoder, Packet, Parser, ParserConfig};

pub(super) const PREAMBLE: &str = "01010101010101010001011010100011";
pub(super) const PACKET_SYMBOLS: usize = 92 * 8;
pub(super) const PACKET_TYPE: u8 = 0x1C;
const CENTER_FREQ: u32 = 912_600_155;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdmPacket {
    pub packet_type: u8,
    pub packet_length: u8,
    pub app_version: u8,
    pub ert_type: u8,
    pub ert_serial: u32,
    pub consumption_interval_count: u8,
    pub last_consumption: u32,
    pub checksum: u16,
}

impl fmt::Display for IdmPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IDM id:{:10} type:{:2} intervals:{:3} last:{:8} crc:{:#06X}",
            self.ert_serial,
            self.ert_type,
            self.consumption_interval_count,
            self.last_consumption,
            self.checksum,
        )
    }
}

pub struct IdmParser {
    decoder: Decoder,
}

impl IdmParser {
    pub fn new(symbol_length: usize) -> Self {
        let cfg = ParserConfig::new(symbol_length, PACKET_SYMBOLS, CENTER_FREQ);
        Self {
            decoder: Decoder::new(cfg, PREAMBLE),
        }
    }
}

impl Parser for IdmParser {
    fn cfg(&self) -> &ParserConfig {
        self.decoder.cfg()
    }

    fn protocol(&self) -> &'static str {
        "idm"
    }

    fn decode(&mut self, block: &[u8]) -> Vec<usize> {
        self.decoder.decode(block)
    }

    fn parse(&mut self, indices: &[usize]) -> Vec<Packet> {
        let mut seen = HashSet::new();
        let mut packets = Vec::new();

        for &idx in indices {
            let bytes = self.decoder.packet_bytes(idx, PACKET_SYMBOLS);
            if bytes[4] != PACKET_TYPE {
                continue;
            }
            if crc16(CCITT_POLY, CCITT_INIT, &bytes[4..92]) != 0 {
                continue;
            }
            if !seen.insert(bytes.clone()) {
                continue;
            }

            packets.push(Packet::Idm(IdmPacket {
                packet_type: bytes[4],
                packet_length: bytes[5],
                app_version: bytes[7],
                ert_type: bytes[8],
                ert_serial: field(&bytes, 9 * 8, 32) as u32,
                consumption_interval_count: bytes[13],
                last_consumption: field(&bytes, 14 * 8, 32) as u32,
                checksum: field(&bytes, 90 * 8, 16) as u16,
            }));
        }

        packets
    }

    fn raw_window(&self) -> &[u8] {
        self.decoder.iq()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testfix;
    use super::*;

    #[test]
    fn test_parse_synthesized_packet() {
        let mut parser = IdmParser::new(4);
        let bytes = testfix::idm_bytes(87_654_321, 8, 55_443);
        let block = testfix::block_with(parser.cfg(), 512, &bytes, PACKET_SYMBOLS);

        let indices = parser.decode(&block);
        let packets = parser.parse(&indices);
        assert_eq!(packets.len(), 1);

        match &packets[0] {
            Packet::Idm(p) => {
                assert_eq!(p.ert_serial, 87_654_321);
                assert_eq!(p.ert_type, 8);
                assert_eq!(p.last_consumption, 55_443);
                assert_eq!(p.packet_type, PACKET_TYPE);
            }
            other => panic!("expected IDM packet, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_packet_type_rejected() {
        let mut parser = IdmParser::new(4);
        let mut bytes = testfix::idm_bytes(87_654_321, 8, 55_443);
        bytes[4] = 0x1D;
        let block = testfix::block_with(parser.cfg(), 512, &bytes, PACKET_SYMBOLS);

        let indices = parser.decode(&block);
        assert!(parser.parse(&indices).is_empty());
    }
}
