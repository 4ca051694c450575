//! Stream splitter: lossless fan-out of the sample stream
//!
//! One thread reads fixed-size chunks from the sample source and forwards
//! each chunk to one or two conduits, one per decode pipeline. Conduits are
//! small-bounded blocking channels: a pipeline that falls behind
//! backpressures the splitter and therefore the source read loop. When the
//! splitter stops (source EOF, read error, or a requested stop) it drops
//! its writers, which closes every conduit and releases any reader blocked
//! mid-block.

use crossbeam_channel::{bounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::pipeline::Shutdown;
use crate::source::SampleSource;

/// Bytes read from the source per iteration, independent of any parser's
/// block geometry.
pub const CHUNK_SIZE: usize = 16384;

/// Chunks buffered per conduit before the splitter blocks.
pub const CONDUIT_DEPTH: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("sample stream closed")]
pub struct StreamClosed;

/// Create one blocking byte conduit.
pub fn conduit(depth: usize) -> (ConduitWriter, ConduitReader) {
    let (tx, rx) = bounded(depth);
    (
        ConduitWriter { tx },
        ConduitReader {
            rx,
            pending: Vec::new(),
            pos: 0,
        },
    )
}

pub struct ConduitWriter {
    tx: Sender<Vec<u8>>,
}

impl ConduitWriter {
    /// Forward one chunk, blocking while the conduit is full. Fails once
    /// the reader is gone.
    pub fn write(&self, chunk: &[u8]) -> Result<(), StreamClosed> {
        self.tx.send(chunk.to_vec()).map_err(|_| StreamClosed)
    }
}

pub struct ConduitReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pos: usize,
}

impl ConduitReader {
    /// Fill `block` completely with the next bytes of the stream, blocking
    /// until they arrive. Bytes are delivered in source order with no gaps
    /// or duplication. Fails if the writer stopped before a full block.
    pub fn read_block(&mut self, block: &mut [u8]) -> Result<(), StreamClosed> {
        let mut filled = 0;

        while filled < block.len() {
            if self.pos == self.pending.len() {
                match self.rx.recv() {
                    Ok(chunk) => {
                        self.pending = chunk;
                        self.pos = 0;
                    }
                    Err(_) => return Err(StreamClosed),
                }
                continue;
            }

            let n = (block.len() - filled).min(self.pending.len() - self.pos);
            block[filled..filled + n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
            filled += n;
            self.pos += n;
        }

        Ok(())
    }
}

/// The splitter task: owns the sample source exclusively.
pub struct StreamSplitter {
    source: Box<dyn SampleSource>,
    outputs: Vec<ConduitWriter>,
    shutdown: Shutdown,
}

impl StreamSplitter {
    pub fn new(source: Box<dyn SampleSource>, outputs: Vec<ConduitWriter>, shutdown: Shutdown) -> Self {
        Self {
            source,
            outputs,
            shutdown,
        }
    }

    pub fn run(mut self) {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;

        loop {
            if self.shutdown.poll().is_some() {
                debug!("splitter: stop requested after {total} bytes");
                break;
            }

            match self.source.read(&mut chunk) {
                Ok(0) => {
                    info!("splitter: sample source ended after {total} bytes");
                    break;
                }
                Ok(n) => {
                    total += n as u64;
                    // A writer fails only once its pipeline is gone, and a
                    // pipeline only leaves after requesting a stop or
                    // failing fatally; wind down either way.
                    if self.outputs.iter().any(|out| out.write(&chunk[..n]).is_err()) {
                        debug!("splitter: conduit closed, stopping");
                        break;
                    }
                }
                Err(e) => {
                    error!("splitter: sample source read failed: {e}");
                    break;
                }
            }
        }
        // Dropping self.outputs closes the conduits and releases readers.
    }
}
