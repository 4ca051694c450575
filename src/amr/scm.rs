//! SCM - Standard Consumption Message parser
//!
//! 96-bit Manchester packet carrying a 23-bit meter id, 4-bit meter type,
//! tamper flags, and a 27-bit consumption counter, closed by a 16-bit BCH
//! checksum over bytes 2..12.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

use super::crc::{crc16, SCM_POLY};
use super::{field, Decoder, Packet, Parser, ParserConfig};

pub(super) const PREAMBLE: &str = "111110010101001100000";
pub(super) const PACKET_SYMBOLS: usize = 96;
const CENTER_FREQ: u32 = 912_600_155;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScmPacket {
    pub id: u32,
    pub meter_type: u8,
    pub tamper_phy: u8,
    pub tamper_enc: u8,
    pub consumption: u32,
    pub checksum: u16,
}

impl fmt::Display for ScmPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SCM id:{:10} type:{:2} tamper:{}/{} consumption:{:8} crc:{:#06X}",
            self.id, self.meter_type, self.tamper_phy, self.tamper_enc, self.consumption, self.checksum,
        )
    }
}

pub struct ScmParser {
    decoder: Decoder,
}

impl ScmParser {
    pub fn new(symbol_length: usize) -> Self {
        let cfg = ParserConfig::new(symbol_length, PACKET_SYMBOLS, CENTER_FREQ);
        Self {
            decoder: Decoder::new(cfg, PREAMBLE),
        }
    }
}

impl Parser for ScmParser {
    fn cfg(&self) -> &ParserConfig {
        self.decoder.cfg()
    }

    fn protocol(&self) -> &'static str {
        "scm"
    }

    fn decode(&mut self, block: &[u8]) -> Vec<usize> {
        self.decoder.decode(block)
    }

    fn parse(&mut self, indices: &[usize]) -> Vec<Packet> {
        // Adjacent offsets often quantize to the same packet
        let mut seen = HashSet::new();
        let mut packets = Vec::new();

        for &idx in indices {
            let bytes = self.decoder.packet_bytes(idx, PACKET_SYMBOLS);
            if crc16(SCM_POLY, 0, &bytes[2..12]) != 0 {
                continue;
            }
            if !seen.insert(bytes.clone()) {
                continue;
            }

            packets.push(Packet::Scm(ScmPacket {
                id: ((field(&bytes, 21, 2) << 21) | field(&bytes, 35, 21)) as u32,
                meter_type: field(&bytes, 26, 4) as u8,
                tamper_phy: field(&bytes, 24, 2) as u8,
                tamper_enc: field(&bytes, 30, 2) as u8,
                consumption: ((field(&bytes, 32, 3) << 24) | field(&bytes, 56, 24)) as u32,
                checksum: field(&bytes, 80, 16) as u16,
            }));
        }

        packets
    }

    fn raw_window(&self) -> &[u8] {
        self.decoder.iq()
    }
}
