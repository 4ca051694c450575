//! R900 - proprietary fixed-format packet parser
//!
//! 120-bit packet: 24-bit sync word, 32-bit meter id, 8-bit type, 24-bit
//! consumption counter, a 16-bit undocumented tail kept as opaque hex, and
//! a CRC-16/CCITT checksum over bytes 3..15.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::crc::{crc16, CCITT_POLY};
use super::{field, Decoder, Packet, Parser, ParserConfig};

pub(super) const PREAMBLE: &str = "001100110011001111010101";
pub(super) const PACKET_SYMBOLS: usize = 120;
const CENTER_FREQ: u32 = 912_380_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct R900Packet {
    pub id: u32,
    pub meter_type: u8,
    pub consumption: u32,
    /// Undocumented trailing bits, hex-encoded
    pub extra: String,
    pub checksum: u16,
}

impl fmt::Display for R900Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R900 id:{:10} type:{:2} consumption:{:8} extra:{} crc:{:#06X}",
            self.id, self.meter_type, self.consumption, self.extra, self.checksum,
        )
    }
}

pub struct R900Parser {
    decoder: Decoder,
}

impl R900Parser {
    pub fn new(symbol_length: usize) -> Self {
        let cfg = ParserConfig::new(symbol_length, PACKET_SYMBOLS, CENTER_FREQ);
        Self {
            decoder: Decoder::new(cfg, PREAMBLE),
        }
    }
}

impl Parser for R900Parser {
    fn cfg(&self) -> &ParserConfig {
        self.decoder.cfg()
    }

    fn protocol(&self) -> &'static str {
        "r900"
    }

    fn decode(&mut self, block: &[u8]) -> Vec<usize> {
        self.decoder.decode(block)
    }

    fn parse(&mut self, indices: &[usize]) -> Vec<Packet> {
        let mut seen = HashSet::new();
        let mut packets = Vec::new();

        for &idx in indices {
            let bytes = self.decoder.packet_bytes(idx, PACKET_SYMBOLS);
            if crc16(CCITT_POLY, 0, &bytes[3..15]) != 0 {
                continue;
            }
            if !seen.insert(bytes.clone()) {
                continue;
            }

            packets.push(Packet::R900(R900Packet {
                id: field(&bytes, 24, 32) as u32,
                meter_type: field(&bytes, 56, 8) as u8,
                consumption: field(&bytes, 64, 24) as u32,
                extra: hex::encode(&bytes[11..13]),
                checksum: field(&bytes, 104, 16) as u16,
            }));
        }

        packets
    }

    fn raw_window(&self) -> &[u8] {
        self.decoder.iq()
    }
}
