//! Manchester symbol decoding for ERT sample blocks
//!
//! ERT meters transmit OOK Manchester-coded packets in the 900MHz ISM band.
//! Decoding works on raw 8-bit unsigned IQ pairs:
//! 1. Convert IQ pairs to magnitude via a lookup table
//! 2. Matched-filter each sample offset over one symbol period
//!    (first half-symbol sum minus second half-symbol sum)
//! 3. Quantize: positive filter output is a 1 bit
//! 4. Search every offset for the protocol's preamble pattern
//!
//! The decoder keeps a rolling window of the previous packet length so
//! packets spanning a block boundary still decode on the next block.

use super::ParserConfig;

/// Pre-computed magnitude lookup table for fast IQ → magnitude conversion.
/// Index: (I << 8) | Q where I, Q are raw 0-255 sample bytes.
pub struct MagnitudeTable {
    table: Vec<f32>,
}

impl MagnitudeTable {
    pub fn new() -> Self {
        let mut table = vec![0.0f32; 256 * 256];

        for i in 0..256usize {
            for q in 0..256usize {
                // Center the unsigned samples at zero
                let si = i as f32 - 127.5;
                let sq = q as f32 - 127.5;
                table[(i << 8) | q] = (si * si + sq * sq).sqrt();
            }
        }

        Self { table }
    }

    #[inline(always)]
    pub fn magnitude(&self, i: u8, q: u8) -> f32 {
        self.table[((i as usize) << 8) | (q as usize)]
    }
}

impl Default for MagnitudeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared symbol decoder behind every parser variant.
pub struct Decoder {
    cfg: ParserConfig,
    preamble: Vec<bool>,
    lut: MagnitudeTable,
    /// Rolling IQ window: previous packet-length tail + newest block
    iq: Vec<u8>,
    /// Cumulative magnitude sums, one entry per sample plus a leading zero
    csum: Vec<f64>,
    /// Matched-filter output per candidate sample offset
    filtered: Vec<f32>,
}

impl Decoder {
    pub fn new(cfg: ParserConfig, preamble_bits: &str) -> Self {
        let preamble = preamble_bits.chars().map(|c| c == '1').collect();
        let iq = vec![0u8; cfg.buffer_bytes()];
        let csum = vec![0.0f64; cfg.buffer_length + 1];
        let filtered = vec![0.0f32; cfg.buffer_length - 2 * cfg.symbol_length + 1];

        Self {
            cfg,
            preamble,
            lut: MagnitudeTable::new(),
            iq,
            csum,
            filtered,
        }
    }

    pub fn cfg(&self) -> &ParserConfig {
        &self.cfg
    }

    /// IQ bytes backing the most recent decode, one full buffer window.
    pub fn iq(&self) -> &[u8] {
        &self.iq
    }

    /// Feed one block of IQ bytes and return candidate packet start offsets.
    ///
    /// `block` must be exactly `cfg.block_bytes()` long.
    pub fn decode(&mut self, block: &[u8]) -> Vec<usize> {
        debug_assert_eq!(block.len(), self.cfg.block_bytes());

        // Slide the window: keep the last packet length, append the block
        let tail = self.iq.len() - block.len();
        self.iq.copy_within(block.len().., 0);
        self.iq[tail..].copy_from_slice(block);

        // Magnitude cumulative sums over the whole window
        for i in 0..self.cfg.buffer_length {
            let mag = self.lut.magnitude(self.iq[2 * i], self.iq[2 * i + 1]);
            self.csum[i + 1] = self.csum[i] + mag as f64;
        }

        // Matched filter: half-symbol sum difference at every offset
        let sl = self.cfg.symbol_length;
        for i in 0..self.filtered.len() {
            let first = self.csum[i + sl] - self.csum[i];
            let second = self.csum[i + 2 * sl] - self.csum[i + sl];
            self.filtered[i] = (first - second) as f32;
        }

        // Exhaustive preamble search; checksums weed out false positives
        let last = self.cfg.buffer_length - self.cfg.packet_samples;
        let mut indices = Vec::new();
        for idx in 0..=last {
            let hit = self
                .preamble
                .iter()
                .enumerate()
                .all(|(n, &bit)| (self.filtered[idx + n * 2 * sl] > 0.0) == bit);
            if hit {
                indices.push(idx);
            }
        }

        indices
    }

    /// Quantized Manchester bit `n` of a packet starting at sample `idx`.
    #[inline]
    pub fn bit(&self, idx: usize, n: usize) -> bool {
        self.filtered[idx + n * 2 * self.cfg.symbol_length] > 0.0
    }

    /// Pack `symbols` quantized bits starting at `idx` into MSB-first bytes.
    pub fn packet_bytes(&self, idx: usize, symbols: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; (symbols + 7) / 8];
        for n in 0..symbols {
            if self.bit(idx, n) {
                bytes[n / 8] |= 0x80 >> (n % 8);
            }
        }
        bytes
    }
}


#[cfg(test)]
mod tests {
    use super::synth;
    use super::*;

    fn test_cfg() -> ParserConfig {
        // Tiny geometry keeps the exhaustive search fast in tests
        ParserConfig::new(4, 24, 912_600_155)
    }

    #[test]
    fn test_magnitude_table() {
        let lut = MagnitudeTable::new();

        let center = lut.magnitude(127, 127);
        assert!(center < 1.0, "center should be near zero, got {center}");

        let high_i = lut.magnitude(255, 127);
        assert!(high_i > 100.0, "high I should give high magnitude");

        let high_q = lut.magnitude(127, 0);
        assert!(high_q > 100.0, "high Q should give high magnitude");
    }

    #[test]
    fn test_preamble_found_at_placed_offset() {
        let cfg = test_cfg();
        let preamble = "110100";
        let mut decoder = Decoder::new(cfg.clone(), preamble);

        let bits: Vec<bool> = "110100101011001010110010".chars().map(|c| c == '1').collect();
        let mut block = synth::quiet_block(cfg.block_size);
        synth::place(&mut block, 37, &synth::manchester_iq(&bits, cfg.symbol_length));

        let indices = decoder.decode(&block);
        // Packet lands after the rolled-over tail of the previous window
        let expect = cfg.packet_samples + 37;
        assert!(indices.contains(&expect), "expected offset {expect} in {indices:?}");

        for (n, &bit) in bits.iter().enumerate() {
            assert_eq!(decoder.bit(expect, n), bit, "bit {n}");
        }
    }

    #[test]
    fn test_packet_bytes_roundtrip() {
        let cfg = test_cfg();
        let mut decoder = Decoder::new(cfg.clone(), "1011");

        let bytes = [0xB5, 0x21, 0x4A];
        let bits = synth::bits_of(&bytes, 24);
        let mut block = synth::quiet_block(cfg.block_size);
        synth::place(&mut block, 12, &synth::manchester_iq(&bits, cfg.symbol_length));

        let indices = decoder.decode(&block);
        let idx = cfg.packet_samples + 12;
        assert!(indices.contains(&idx));
        assert_eq!(decoder.packet_bytes(idx, 24), bytes);
    }

    #[test]
    fn test_packet_spanning_block_boundary() {
        let cfg = test_cfg();
        let mut decoder = Decoder::new(cfg.clone(), "1011");

        let bytes = [0xB6, 0x3C, 0x99];
        let iq = synth::manchester_iq(&synth::bits_of(&bytes, 24), cfg.symbol_length);

        // Start the packet close to the end of the first block
        let start = cfg.block_size - cfg.packet_samples / 2;
        let mut stream = synth::quiet_block(cfg.block_size * 2);
        synth::place(&mut stream, start, &iq);

        let (a, b) = stream.split_at(cfg.block_bytes());
        let first = decoder.decode(a);
        assert!(
            !first.iter().any(|&i| decoder.packet_bytes(i, 24) == bytes),
            "packet should not decode from a half-received block"
        );

        // After the second block the packet sits inside the rolled window
        let second = decoder.decode(b);
        let idx = cfg.packet_samples + start - cfg.block_size;
        assert!(second.contains(&idx), "expected offset {idx} in {second:?}");
        assert_eq!(decoder.packet_bytes(idx, 24), bytes);
    }
}
