//! Decode pipeline: block read, decode, filter, log, capture
//!
//! One pipeline per active parser, each consuming its own conduit. The loop
//! polls its stop conditions before every block read, so interrupt and
//! deadline are cooperative: a pipeline blocked mid-read is released only by
//! conduit closure, then re-polls before treating the closure as fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::amr::{Packet, Parser};
use crate::filter::{FilterChain, MeterIdFilter};
use crate::output::{LogMessage, LogSink, RawCapture};
use crate::splitter::ConduitReader;

/// Why a pipeline left its run loop. A fatal error is reported as `Err`
/// from [`DecodePipeline::run`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupted,
    DeadlineReached,
    CompletionSetEmpty,
}

/// Shared termination controller: a process-wide stop flag plus an optional
/// wall-clock deadline measured from process start. Polled cooperatively.
#[derive(Clone)]
pub struct Shutdown {
    stop: Arc<AtomicBool>,
    start: Instant,
    deadline: Option<Duration>,
}

impl Shutdown {
    pub fn new(deadline: Option<Duration>) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            start: Instant::now(),
            deadline,
        }
    }

    /// Request a process-wide stop. Set by the interrupt handler, by a
    /// pipeline whose completion set drained, or on a fatal pipeline error
    /// so the peer pipeline and splitter wind down too.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// First satisfied stop condition, if any.
    pub fn poll(&self) -> Option<StopReason> {
        if self.stop_requested() {
            return Some(StopReason::Interrupted);
        }
        if let Some(limit) = self.deadline {
            if self.start.elapsed() >= limit {
                return Some(StopReason::DeadlineReached);
            }
        }
        None
    }
}

pub struct DecodePipeline {
    parser: Box<dyn Parser>,
    conduit: ConduitReader,
    chain: FilterChain,
    /// Identifier set drained by single-shot mode; `None` leaves completion
    /// out of the stop conditions.
    completion: Option<Arc<MeterIdFilter>>,
    log: Arc<LogSink>,
    capture: Arc<RawCapture>,
    shutdown: Shutdown,
}

impl DecodePipeline {
    pub fn new(
        parser: Box<dyn Parser>,
        conduit: ConduitReader,
        chain: FilterChain,
        completion: Option<Arc<MeterIdFilter>>,
        log: Arc<LogSink>,
        capture: Arc<RawCapture>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            parser,
            conduit,
            chain,
            completion,
            log,
            capture,
            shutdown,
        }
    }

    /// Run until a stop condition fires. Fatal errors (short block read,
    /// encode failure, capture write failure) are returned as `Err` and
    /// abort the whole receiver.
    pub fn run(mut self) -> Result<StopReason> {
        let cfg = self.parser.cfg().clone();
        let protocol = self.parser.protocol();
        let mut block = vec![0u8; cfg.block_bytes()];
        let mut blocks = 0u64;

        info!(
            "{protocol}: pipeline running, {} samples per block",
            cfg.block_size
        );

        loop {
            if let Some(reason) = self.shutdown.poll() {
                if reason == StopReason::DeadlineReached {
                    info!("{protocol}: time limit reached after {:?}", self.shutdown.elapsed());
                }
                debug!("{protocol}: stopping after {blocks} blocks: {reason:?}");
                return Ok(reason);
            }

            if self.conduit.read_block(&mut block).is_err() {
                // The splitter closes the conduits on a requested stop as
                // well as on source failure; only the latter is fatal.
                if let Some(reason) = self.shutdown.poll() {
                    return Ok(reason);
                }
                bail!("{protocol}: sample stream ended mid-block");
            }
            blocks += 1;

            let indices = self.parser.decode(&block);
            let packets = self.parser.parse(&indices);
            let accepted: Vec<Packet> = packets
                .into_iter()
                .filter(|pkt| self.chain.matches(pkt))
                .collect();
            if accepted.is_empty() {
                continue;
            }

            // One critical section per block: the offset recorded in each
            // record must be the capture position before this block's
            // window lands, even with the peer pipeline appending too.
            {
                let mut capture = self.capture.lock();
                let offset = capture.offset();

                for packet in accepted {
                    let msg = LogMessage {
                        time: Utc::now(),
                        offset,
                        length: cfg.buffer_bytes(),
                        message: packet,
                    };
                    self.log
                        .write(&msg)
                        .with_context(|| format!("{protocol}: encoding log record"))?;

                    if let Some(ids) = &self.completion {
                        ids.remove(msg.message.meter_id());
                    }
                }

                capture
                    .append(self.parser.raw_window())
                    .with_context(|| format!("{protocol}: appending raw samples"))?;
            }

            if let Some(ids) = &self.completion {
                if ids.is_empty() {
                    info!("{protocol}: all target meters heard");
                    self.shutdown.request_stop();
                    return Ok(StopReason::CompletionSetEmpty);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amr::{testfix, ScmParser};
    use crate::output::{JsonEncoder, SharedBuf};
    use crate::splitter::conduit;

    const SYMBOL_LENGTH: usize = 8;

    struct Fixture {
        log_buf: SharedBuf,
        capture_buf: SharedBuf,
        log: Arc<LogSink>,
        capture: Arc<RawCapture>,
    }

    impl Fixture {
        fn new() -> Self {
            let log_buf = SharedBuf::new();
            let capture_buf = SharedBuf::new();
            Self {
                log: Arc::new(LogSink::new(Box::new(JsonEncoder::new(log_buf.clone())))),
                capture: Arc::new(RawCapture::to_writer(Box::new(capture_buf.clone()))),
                log_buf,
                capture_buf,
            }
        }

        fn records(&self) -> Vec<serde_json::Value> {
            let out = String::from_utf8(self.log_buf.contents()).unwrap();
            out.trim_end()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn id_filter(ids: &[u32]) -> (FilterChain, Arc<MeterIdFilter>) {
        let filter = Arc::new(MeterIdFilter::new(ids.iter().copied().collect()));
        let mut chain = FilterChain::new();
        chain.add(filter.clone());
        (chain, filter)
    }

    #[test]
    fn test_single_shot_run_terminates_on_completion() {
        let fx = Fixture::new();
        let mut parser = ScmParser::new(SYMBOL_LENGTH);
        let cfg = parser.cfg().clone();
        let bytes = testfix::scm_bytes(42, 4, 9_001);
        let block = testfix::block_with(&cfg, 200, &bytes, 96);

        let (tx, rx) = conduit(8);
        tx.write(&block).unwrap();
        // Leave the writer open: completion must stop the pipeline without
        // reading further blocks.

        let (chain, ids) = id_filter(&[42]);
        let pipeline = DecodePipeline::new(
            Box::new(ScmParser::new(SYMBOL_LENGTH)),
            rx,
            chain,
            Some(ids),
            fx.log.clone(),
            fx.capture.clone(),
            Shutdown::new(None),
        );

        let reason = pipeline.run().unwrap();
        assert_eq!(reason, StopReason::CompletionSetEmpty);

        let records = fx.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"]["id"], 42);
        assert_eq!(records[0]["offset"], 0);
        assert_eq!(records[0]["length"], cfg.buffer_bytes());

        // The capture file holds exactly the decode window, and its tail is
        // the block that produced the packet.
        let captured = fx.capture_buf.contents();
        assert_eq!(captured.len(), cfg.buffer_bytes());
        assert_eq!(&captured[captured.len() - block.len()..], &block[..]);

        // Exercise the decode window on our own parser copy to show the
        // logged offset/length pair recovers the packet.
        let indices = parser.decode(&captured[cfg.packet_samples * 2..]);
        assert!(!parser.parse(&indices).is_empty());
    }

    #[test]
    fn test_rejected_packets_write_nothing() {
        let fx = Fixture::new();
        let cfg = ScmParser::new(SYMBOL_LENGTH).cfg().clone();
        let bytes = testfix::scm_bytes(7, 4, 1);
        let block = testfix::block_with(&cfg, 200, &bytes, 96);

        let (tx, rx) = conduit(8);
        tx.write(&block).unwrap();
        drop(tx);

        let (chain, _ids) = id_filter(&[99]);
        let shutdown = Shutdown::new(None);
        let pipeline = DecodePipeline::new(
            Box::new(ScmParser::new(SYMBOL_LENGTH)),
            rx,
            chain,
            None,
            fx.log.clone(),
            fx.capture.clone(),
            shutdown,
        );

        // Stream ends with nothing accepted: closure is fatal.
        assert!(pipeline.run().is_err());
        assert!(fx.records().is_empty());
        assert!(fx.capture_buf.contents().is_empty());
    }

    #[test]
    fn test_interrupt_checked_before_read() {
        let fx = Fixture::new();
        let (_tx, rx) = conduit(8);
        let shutdown = Shutdown::new(None);
        shutdown.request_stop();

        let pipeline = DecodePipeline::new(
            Box::new(ScmParser::new(SYMBOL_LENGTH)),
            rx,
            FilterChain::new(),
            None,
            fx.log.clone(),
            fx.capture.clone(),
            shutdown,
        );

        // An already-requested stop wins without touching the conduit.
        assert_eq!(pipeline.run().unwrap(), StopReason::Interrupted);
    }

    #[test]
    fn test_deadline_stops_quiet_stream() {
        let fx = Fixture::new();
        let cfg = ScmParser::new(SYMBOL_LENGTH).cfg().clone();
        let (tx, rx) = conduit(2);

        let feeder = std::thread::spawn(move || {
            let quiet = testfix::quiet(&cfg);
            while tx.write(&quiet).is_ok() {}
        });

        let pipeline = DecodePipeline::new(
            Box::new(ScmParser::new(SYMBOL_LENGTH)),
            rx,
            FilterChain::new(),
            None,
            fx.log.clone(),
            fx.capture.clone(),
            Shutdown::new(Some(Duration::from_millis(100))),
        );

        assert_eq!(pipeline.run().unwrap(), StopReason::DeadlineReached);
        assert!(fx.records().is_empty());
        feeder.join().unwrap();
    }
}
