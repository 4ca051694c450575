//! Message log and raw-sample capture sinks
//!
//! Every surviving packet becomes one LogMessage record. When raw capture
//! is enabled the record's offset/length locate the IQ window that produced
//! the packet inside the capture file, so both sinks serialize their writes
//! behind mutexes and a pipeline records the offset before the window is
//! appended.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::amr::Packet;

/// One logged decode event, serialized immediately and never retained.
#[derive(Debug, Clone, Serialize)]
pub struct LogMessage {
    /// Capture timestamp
    pub time: DateTime<Utc>,
    /// Byte offset into the raw-capture file before this event's window
    pub offset: u64,
    /// Raw-sample bytes representing this event
    pub length: usize,
    pub message: Packet,
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} offset:{:10} length:{:7} {}",
            self.time.format("%Y-%m-%dT%H:%M:%S%.3f"),
            self.offset,
            self.length,
            self.message,
        )
    }
}

/// Structured encoder capability for the message log.
pub trait LogEncoder: Send {
    fn encode(&mut self, msg: &LogMessage) -> Result<()>;

    /// Whether the format already terminates each record. When false the
    /// sink asks for a separator after every record.
    fn delimits_records(&self) -> bool;

    fn write_separator(&mut self) -> Result<()>;
}

/// JSON lines via serde_json. The encoder itself does not delimit records,
/// so the sink appends a newline after each one.
pub struct JsonEncoder<W: Write> {
    writer: W,
}

impl<W: Write> JsonEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> LogEncoder for JsonEncoder<W> {
    fn encode(&mut self, msg: &LogMessage) -> Result<()> {
        serde_json::to_writer(&mut self.writer, msg).context("serializing log record")?;
        Ok(())
    }

    fn delimits_records(&self) -> bool {
        false
    }

    fn write_separator(&mut self) -> Result<()> {
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Human-readable single-line records, self-delimiting.
pub struct TextEncoder<W: Write> {
    writer: W,
}

impl<W: Write> TextEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> LogEncoder for TextEncoder<W> {
    fn encode(&mut self, msg: &LogMessage) -> Result<()> {
        writeln!(self.writer, "{msg}").context("writing log record")?;
        self.writer.flush()?;
        Ok(())
    }

    fn delimits_records(&self) -> bool {
        true
    }

    fn write_separator(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Serialized wrapper around the configured encoder; both pipelines log
/// through one sink so records never interleave.
pub struct LogSink {
    encoder: Mutex<Box<dyn LogEncoder>>,
}

impl LogSink {
    pub fn new(encoder: Box<dyn LogEncoder>) -> Self {
        Self {
            encoder: Mutex::new(encoder),
        }
    }

    pub fn write(&self, msg: &LogMessage) -> Result<()> {
        let mut encoder = self.encoder.lock().unwrap();
        encoder.encode(msg)?;
        if !encoder.delimits_records() {
            encoder.write_separator()?;
        }
        Ok(())
    }
}

/// Append-only raw-sample sink with a queryable write offset.
///
/// A disabled sink discards appends and keeps its offset at zero, which is
/// equivalent to capturing into the null device.
pub struct RawCapture {
    inner: Mutex<CaptureInner>,
}

pub struct CaptureInner {
    writer: Option<Box<dyn Write + Send>>,
    offset: u64,
}

impl RawCapture {
    pub fn disabled() -> Self {
        Self {
            inner: Mutex::new(CaptureInner {
                writer: None,
                offset: 0,
            }),
        }
    }

    pub fn create(path: &Path) -> Result<Self> {
        if path.as_os_str() == "/dev/null" || path.as_os_str() == "NUL" {
            return Ok(Self::disabled());
        }
        let file = File::create(path)
            .with_context(|| format!("creating capture file {}", path.display()))?;
        Ok(Self::to_writer(Box::new(file)))
    }

    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Mutex::new(CaptureInner {
                writer: Some(writer),
                offset: 0,
            }),
        }
    }

    /// Lock the sink for one block's offset read and append.
    pub fn lock(&self) -> MutexGuard<'_, CaptureInner> {
        self.inner.lock().unwrap()
    }
}

impl CaptureInner {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.write_all(bytes).context("writing raw samples")?;
            writer.flush().context("flushing raw samples")?;
            self.offset += bytes.len() as u64;
        }
        Ok(())
    }
}

/// Shared in-memory writer for tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SharedBuf(pub std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
