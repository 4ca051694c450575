//! Sample source capability
//!
//! The splitter owns one source exclusively; nothing else reads it. The
//! receiver issues abstract tuner configuration requests through the same
//! trait during assembly.

mod rtltcp;

use std::io;

use anyhow::Result;

pub use rtltcp::RtlTcpSource;

/// Dongle metadata reported by the transport, for operator display.
#[derive(Debug, Clone, Copy)]
pub struct TunerInfo {
    pub tuner_type: u32,
    pub gain_count: u32,
}

pub trait SampleSource: Send {
    /// Read raw IQ bytes. `Ok(0)` means the stream ended.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn set_center_freq(&mut self, hz: u32) -> Result<()>;

    fn set_sample_rate(&mut self, hz: u32) -> Result<()>;

    /// `true` selects automatic gain.
    fn set_gain_mode(&mut self, auto: bool) -> Result<()>;

    /// Manual tuner gain in tenths of a dB.
    fn set_gain(&mut self, tenths_db: i32) -> Result<()>;

    fn tuner_info(&self) -> Option<TunerInfo> {
        None
    }
}
