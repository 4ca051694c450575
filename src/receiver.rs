//! Receiver assembly: source, parsers, filters, splitter, pipelines
//!
//! Built once from configuration. `run` spawns the splitter thread and one
//! thread per decode pipeline, then joins all of them before teardown: the
//! receiver never returns while a pipeline is still running.

use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info, warn};

use crate::amr::{new_parser, MsgType, Parser};
use crate::config::Config;
use crate::filter::{FilterChain, MeterIdFilter, MeterTypeFilter, UniqueFilter};
use crate::output::{LogSink, RawCapture};
use crate::pipeline::{DecodePipeline, Shutdown};
use crate::source::SampleSource;
use crate::splitter::{conduit, StreamSplitter, CONDUIT_DEPTH};

pub struct Receiver {
    source: Box<dyn SampleSource>,
    primary: Box<dyn Parser>,
    secondary: Option<Box<dyn Parser>>,
    chain: FilterChain,
    completion: Option<Arc<MeterIdFilter>>,
    log: Arc<LogSink>,
    capture: Arc<RawCapture>,
    shutdown: Shutdown,
}

impl Receiver {
    pub fn new(
        config: &Config,
        mut source: Box<dyn SampleSource>,
        log: Arc<LogSink>,
        capture: Arc<RawCapture>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let msg_type: MsgType = config.msg_type.parse()?;
        let (primary_kind, secondary_kind) = msg_type.parsers();

        let primary = new_parser(primary_kind, config.symbol_length);
        let secondary = secondary_kind.map(|kind| new_parser(kind, config.symbol_length));

        primary.log_config();
        if let Some(parser) = &secondary {
            parser.log_config();
        }

        if let Some(info) = source.tuner_info() {
            info!("tuner reports {} gain steps", info.gain_count);
        }

        let center_freq = config.center_freq.unwrap_or(primary.cfg().center_freq);
        source
            .set_center_freq(center_freq)
            .context("configuring center frequency")?;

        let sample_rate = config.sample_rate.unwrap_or(primary.cfg().sample_rate);
        source
            .set_sample_rate(sample_rate)
            .context("configuring sample rate")?;

        match config.gain_db {
            Some(db) => {
                source.set_gain_mode(false).context("configuring gain mode")?;
                source
                    .set_gain((db * 10.0) as i32)
                    .context("configuring tuner gain")?;
            }
            None => source.set_gain_mode(true).context("configuring gain mode")?,
        }

        let mut chain = FilterChain::new();
        if config.unique {
            chain.add(Arc::new(UniqueFilter::new()));
        }

        let mut completion = None;
        if !config.filter_ids.is_empty() {
            let ids = Arc::new(MeterIdFilter::new(config.filter_ids.iter().copied().collect()));
            chain.add(ids.clone());
            if config.single {
                completion = Some(ids);
            }
        } else if config.single {
            // An empty completion set must not terminate anything.
            warn!("SINGLE has no effect without FILTER_ID");
        }

        if !config.filter_types.is_empty() {
            chain.add(Arc::new(MeterTypeFilter::new(
                config.filter_types.iter().copied().collect(),
            )));
        }

        Ok(Self {
            source,
            primary,
            secondary,
            chain,
            completion,
            log,
            capture,
            shutdown,
        })
    }

    /// Run until every pipeline stops. Returns the first fatal pipeline
    /// error, if any.
    pub fn run(self) -> Result<()> {
        let Receiver {
            source,
            primary,
            secondary,
            chain,
            completion,
            log,
            capture,
            shutdown,
        } = self;

        let mut outputs = Vec::new();
        let mut pipelines = Vec::new();

        let (tx, rx) = conduit(CONDUIT_DEPTH);
        outputs.push(tx);
        let name = format!("decode-{}", primary.protocol());
        pipelines.push((
            name,
            DecodePipeline::new(
                primary,
                rx,
                chain.clone(),
                completion.clone(),
                log.clone(),
                capture.clone(),
                shutdown.clone(),
            ),
        ));

        // The secondary conduit exists only in dual-protocol mode.
        if let Some(parser) = secondary {
            let (tx, rx) = conduit(CONDUIT_DEPTH);
            outputs.push(tx);
            let name = format!("decode-{}", parser.protocol());
            pipelines.push((
                name,
                DecodePipeline::new(parser, rx, chain, completion, log, capture, shutdown.clone()),
            ));
        }

        let splitter = StreamSplitter::new(source, outputs, shutdown.clone());
        let splitter_handle = thread::Builder::new()
            .name("splitter".to_string())
            .spawn(move || splitter.run())
            .context("spawning splitter thread")?;

        let mut handles = Vec::new();
        for (name, pipeline) in pipelines {
            let shutdown = shutdown.clone();
            handles.push(
                thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        let result = pipeline.run();
                        if result.is_err() {
                            // Release the peer pipeline and the splitter.
                            shutdown.request_stop();
                        }
                        result
                    })
                    .context("spawning pipeline thread")?,
            );
        }

        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(reason)) => info!("pipeline stopped: {reason:?}"),
                Ok(Err(e)) => {
                    error!("pipeline failed: {e:#}");
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(anyhow!("pipeline thread panicked"));
                }
            }
        }

        splitter_handle
            .join()
            .map_err(|_| anyhow!("splitter thread panicked"))?;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
