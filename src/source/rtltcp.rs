//! rtl_tcp client transport
//!
//! Speaks the rtl_tcp wire protocol: on connect the server sends a 12-byte
//! dongle header ("RTL0", tuner type, gain count, both u32 big-endian),
//! then streams raw 8-bit IQ pairs. Configuration requests are 5-byte
//! command frames (command byte + u32 big-endian argument).

use std::io::{self, Read, Write};
use std::net::TcpStream;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::{SampleSource, TunerInfo};

const MAGIC: &[u8; 4] = b"RTL0";

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Command {
    SetCenterFreq = 0x01,
    SetSampleRate = 0x02,
    SetGainMode = 0x03,
    SetGain = 0x04,
    SetAgcMode = 0x08,
}

fn encode_command(cmd: Command, param: u32) -> [u8; 5] {
    let mut frame = [0u8; 5];
    frame[0] = cmd as u8;
    frame[1..5].copy_from_slice(&param.to_be_bytes());
    frame
}

pub struct RtlTcpSource {
    stream: TcpStream,
    info: TunerInfo,
}

impl RtlTcpSource {
    pub fn connect(addr: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .with_context(|| format!("connecting to rtl_tcp server at {addr}"))?;
        stream.set_nodelay(true).ok();

        let mut header = [0u8; 12];
        stream
            .read_exact(&mut header)
            .context("reading rtl_tcp dongle header")?;
        if &header[0..4] != MAGIC {
            bail!("not an rtl_tcp server: bad magic {:02X?}", &header[0..4]);
        }

        let info = TunerInfo {
            tuner_type: u32::from_be_bytes(header[4..8].try_into().unwrap()),
            gain_count: u32::from_be_bytes(header[8..12].try_into().unwrap()),
        };
        info!(
            "connected to rtl_tcp at {addr} (tuner type {}, {} gain steps)",
            info.tuner_type, info.gain_count
        );

        Ok(Self { stream, info })
    }

    fn command(&mut self, cmd: Command, param: u32) -> Result<()> {
        debug!("rtl_tcp command {cmd:?} param {param}");
        self.stream
            .write_all(&encode_command(cmd, param))
            .with_context(|| format!("sending rtl_tcp command {cmd:?}"))?;
        Ok(())
    }
}

impl SampleSource for RtlTcpSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn set_center_freq(&mut self, hz: u32) -> Result<()> {
        self.command(Command::SetCenterFreq, hz)
    }

    fn set_sample_rate(&mut self, hz: u32) -> Result<()> {
        self.command(Command::SetSampleRate, hz)
    }

    fn set_gain_mode(&mut self, auto: bool) -> Result<()> {
        // Gain mode 0 is automatic; mirror it on the RTL2832 AGC.
        self.command(Command::SetGainMode, if auto { 0 } else { 1 })?;
        self.command(Command::SetAgcMode, if auto { 1 } else { 0 })
    }

    fn set_gain(&mut self, tenths_db: i32) -> Result<()> {
        self.command(Command::SetGain, tenths_db as u32)
    }

    fn tuner_info(&self) -> Option<TunerInfo> {
        Some(self.info)
    }
}
