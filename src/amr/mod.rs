//! ERT packet parsers for 900MHz ISM band smart meters
//!
//! Three protocol variants share one Manchester decoder:
//! - SCM: Standard Consumption Message, 96-bit Manchester packet
//! - IDM: Interval Data Message, 92-byte packet with per-interval data
//! - R900: proprietary fixed-format packet
//!
//! Each parser exposes its block geometry, turns a raw sample block into
//! candidate symbol-timing indices, and parses those into packets.

pub mod crc;
mod decode;
mod idm;
mod r900;
mod scm;

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Serialize;

pub use decode::{Decoder, MagnitudeTable};
pub use idm::{IdmPacket, IdmParser};
pub use r900::{R900Packet, R900Parser};
pub use scm::{ScmPacket, ScmParser};

/// On-air half-symbol rate for ERT transmissions, in symbols per second.
pub const SYMBOL_RATE: usize = 32768;

/// Default samples per half-symbol (sets the sample rate).
pub const DEFAULT_SYMBOL_LENGTH: usize = 72;

/// Block geometry and tuning parameters for one parser variant.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Samples per half-symbol
    pub symbol_length: usize,
    /// Manchester bits per packet
    pub packet_symbols: usize,
    /// Samples spanning one packet
    pub packet_samples: usize,
    /// Samples read from the conduit per iteration
    pub block_size: usize,
    /// Samples retained per decode: one packet length plus one block
    pub buffer_length: usize,
    pub sample_rate: u32,
    pub center_freq: u32,
}

impl ParserConfig {
    pub fn new(symbol_length: usize, packet_symbols: usize, center_freq: u32) -> Self {
        let packet_samples = packet_symbols * 2 * symbol_length;
        let block_size = packet_samples.next_power_of_two();

        Self {
            symbol_length,
            packet_symbols,
            packet_samples,
            block_size,
            buffer_length: packet_samples + block_size,
            sample_rate: (SYMBOL_RATE * symbol_length) as u32,
            center_freq,
        }
    }

    /// Bytes read from the conduit per iteration (two bytes per IQ sample).
    pub fn block_bytes(&self) -> usize {
        self.block_size * 2
    }

    /// Bytes of raw IQ backing one decode, appended per capture write.
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_length * 2
    }
}

/// A decoded meter transmission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Packet {
    Scm(ScmPacket),
    Idm(IdmPacket),
    R900(R900Packet),
}

impl Packet {
    pub fn meter_id(&self) -> u32 {
        match self {
            Packet::Scm(p) => p.id,
            Packet::Idm(p) => p.ert_serial,
            Packet::R900(p) => p.id,
        }
    }

    pub fn meter_type(&self) -> u8 {
        match self {
            Packet::Scm(p) => p.meter_type,
            Packet::Idm(p) => p.ert_type,
            Packet::R900(p) => p.meter_type,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Scm(p) => p.fmt(f),
            Packet::Idm(p) => p.fmt(f),
            Packet::R900(p) => p.fmt(f),
        }
    }
}

/// Parser capability: block geometry plus the decode and parse steps.
pub trait Parser: Send {
    fn cfg(&self) -> &ParserConfig;

    /// Protocol name for thread names and diagnostics.
    fn protocol(&self) -> &'static str;

    /// Feed one block of IQ bytes, returning candidate packet offsets.
    fn decode(&mut self, block: &[u8]) -> Vec<usize>;

    /// Parse candidate offsets into zero or more checksum-valid packets.
    fn parse(&mut self, indices: &[usize]) -> Vec<Packet>;

    /// Raw IQ window backing the most recent decode.
    fn raw_window(&self) -> &[u8];

    /// Log the parser configuration for the operator.
    fn log_config(&self) {
        let cfg = self.cfg();
        tracing::info!(
            "{}: symbol length {}, block {} samples, sample rate {} Hz, center {} Hz",
            self.protocol(),
            cfg.symbol_length,
            cfg.block_size,
            cfg.sample_rate,
            cfg.center_freq,
        );
    }
}

/// Closed set of parser variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Scm,
    Idm,
    R900,
}

/// Construct the parser for one protocol variant.
pub fn new_parser(kind: ParserKind, symbol_length: usize) -> Box<dyn Parser> {
    match kind {
        ParserKind::Scm => Box::new(ScmParser::new(symbol_length)),
        ParserKind::Idm => Box::new(IdmParser::new(symbol_length)),
        ParserKind::R900 => Box::new(R900Parser::new(symbol_length)),
    }
}

/// Receiver message-type selection, including the dual-protocol mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Scm,
    Idm,
    ScmPlusIdm,
    R900,
}

impl MsgType {
    /// Primary parser and, in dual-protocol mode, the secondary one.
    pub fn parsers(self) -> (ParserKind, Option<ParserKind>) {
        match self {
            MsgType::Scm => (ParserKind::Scm, None),
            MsgType::Idm => (ParserKind::Idm, None),
            MsgType::ScmPlusIdm => (ParserKind::Idm, Some(ParserKind::Scm)),
            MsgType::R900 => (ParserKind::R900, None),
        }
    }
}

impl FromStr for MsgType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scm" => Ok(MsgType::Scm),
            "idm" => Ok(MsgType::Idm),
            "scm+idm" | "idm+scm" => Ok(MsgType::ScmPlusIdm),
            "r900" => Ok(MsgType::R900),
            other => bail!("invalid message type {other:?} (expected scm, idm, scm+idm, or r900)"),
        }
    }
}

/// Extract `len` bits starting at bit `start` from MSB-first packet bytes.
pub(crate) fn field(bytes: &[u8], start: usize, len: usize) -> u64 {
    let mut out = 0u64;
    for n in start..start + len {
        out <<= 1;
        if bytes[n / 8] & (0x80 >> (n % 8)) != 0 {
            out |= 1;
        }
    }
    out
}

/// Test-only packet and block synthesis shared across module tests.
#[cfg(test)]
pub(crate) mod testfix {
    use super::decode::synth;
    use super::{crc, idm, r900, scm, ParserConfig};

    /// Write `len` bits of `value` MSB-first at bit offset `start`.
    pub fn set_field(bytes: &mut [u8], start: usize, len: usize, value: u64) {
        for k in 0..len {
            let n = start + k;
            if (value >> (len - 1 - k)) & 1 != 0 {
                bytes[n / 8] |= 0x80 >> (n % 8);
            } else {
                bytes[n / 8] &= !(0x80 >> (n % 8));
            }
        }
    }

    /// A checksum-valid SCM packet. The id must fit the 23-bit field.
    pub fn scm_bytes(id: u32, meter_type: u8, consumption: u32) -> Vec<u8> {
        debug_assert!(id < 1 << 23, "SCM id {id} exceeds 23 bits");
        debug_assert!(consumption < 1 << 27, "SCM consumption {consumption} exceeds 27 bits");
        let mut b = vec![0u8; 12];
        for (n, c) in scm::PREAMBLE.chars().enumerate() {
            if c == '1' {
                b[n / 8] |= 0x80 >> (n % 8);
            }
        }
        set_field(&mut b, 21, 2, (id >> 21) as u64);
        set_field(&mut b, 26, 4, meter_type as u64);
        set_field(&mut b, 32, 3, (consumption >> 24) as u64);
        set_field(&mut b, 35, 21, (id & 0x1F_FFFF) as u64);
        set_field(&mut b, 56, 24, (consumption & 0xFF_FFFF) as u64);
        let crc = crc::crc16(crc::SCM_POLY, 0, &b[2..10]);
        b[10..12].copy_from_slice(&crc.to_be_bytes());
        b
    }

    /// A checksum-valid IDM packet.
    pub fn idm_bytes(serial: u32, ert_type: u8, last_consumption: u32) -> Vec<u8> {
        let mut b = vec![0u8; 92];
        b[0..4].copy_from_slice(&0x5555_16A3u32.to_be_bytes());
        b[4] = idm::PACKET_TYPE;
        b[5] = 0x5C;
        b[7] = 0x04;
        b[8] = ert_type;
        b[9..13].copy_from_slice(&serial.to_be_bytes());
        b[13] = 3;
        b[14..18].copy_from_slice(&last_consumption.to_be_bytes());
        let crc = crc::crc16(crc::CCITT_POLY, crc::CCITT_INIT, &b[4..90]);
        b[90..92].copy_from_slice(&crc.to_be_bytes());
        b
    }

    /// A checksum-valid R900 packet.
    pub fn r900_bytes(id: u32, meter_type: u8, consumption: u32) -> Vec<u8> {
        let mut b = vec![0u8; 15];
        for (n, c) in r900::PREAMBLE.chars().enumerate() {
            if c == '1' {
                b[n / 8] |= 0x80 >> (n % 8);
            }
        }
        set_field(&mut b, 24, 32, id as u64);
        set_field(&mut b, 56, 8, meter_type as u64);
        set_field(&mut b, 64, 24, consumption as u64);
        set_field(&mut b, 88, 16, 0xBEEF);
        let crc = crc::crc16(crc::CCITT_POLY, 0, &b[3..13]);
        b[13..15].copy_from_slice(&crc.to_be_bytes());
        b
    }

    /// One quiet block of the parser's geometry.
    pub fn quiet(cfg: &ParserConfig) -> Vec<u8> {
        synth::quiet_block(cfg.block_size)
    }

    /// One block with a Manchester-encoded packet at a sample offset.
    pub fn block_with(cfg: &ParserConfig, sample_offset: usize, bytes: &[u8], nbits: usize) -> Vec<u8> {
        let iq = synth::manchester_iq(&synth::bits_of(bytes, nbits), cfg.symbol_length);
        assert!(sample_offset * 2 + iq.len() <= cfg.block_bytes(), "packet does not fit in block");
        let mut block = quiet(cfg);
        synth::place(&mut block, sample_offset, &iq);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_extraction() {
        let bytes = [0b1010_1100, 0b0011_0101];
        assert_eq!(field(&bytes, 0, 4), 0b1010);
        assert_eq!(field(&bytes, 4, 8), 0b1100_0011);
        assert_eq!(field(&bytes, 15, 1), 1);
    }

    #[test]
    fn test_msg_type_parsing() {
        assert_eq!("scm".parse::<MsgType>().unwrap(), MsgType::Scm);
        assert_eq!("SCM+IDM".parse::<MsgType>().unwrap(), MsgType::ScmPlusIdm);
        assert_eq!("r900".parse::<MsgType>().unwrap(), MsgType::R900);
        assert!("fsk".parse::<MsgType>().is_err());
    }

    #[test]
    fn test_dual_mode_selects_two_parsers() {
        let (primary, secondary) = MsgType::ScmPlusIdm.parsers();
        assert_eq!(primary, ParserKind::Idm);
        assert_eq!(secondary, Some(ParserKind::Scm));

        let (_, secondary) = MsgType::Scm.parsers();
        assert!(secondary.is_none());
    }

    #[test]
    fn test_block_geometry() {
        let cfg = ParserConfig::new(72, 96, 912_600_155);
        assert_eq!(cfg.packet_samples, 13824);
        assert_eq!(cfg.block_size, 16384);
        assert_eq!(cfg.buffer_length, 13824 + 16384);
        assert_eq!(cfg.sample_rate, 2_359_296);
        assert_eq!(cfg.block_bytes(), 32768);
    }
}
