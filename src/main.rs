mod amr;
mod config;
mod filter;
mod output;
mod pipeline;
mod receiver;
mod source;
mod splitter;

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::output::{JsonEncoder, LogEncoder, LogSink, RawCapture, TextEncoder};
use crate::pipeline::Shutdown;
use crate::receiver::Receiver;
use crate::source::RtlTcpSource;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_env();

    info!("AMR Capture Service starting");
    info!("rtl_tcp server: {}", config.server);
    info!("message type: {}", config.msg_type);
    if let Some(duration) = config.duration {
        info!("run limit: {}s", duration.as_secs());
    }

    let writer: Box<dyn Write + Send> = match &config.log_file {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("creating log file {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    let encoder: Box<dyn LogEncoder> = match config.log_format.as_str() {
        "json" => Box::new(JsonEncoder::new(writer)),
        "text" | "plain" => Box::new(TextEncoder::new(writer)),
        other => bail!("invalid log format {other:?} (expected text or json)"),
    };
    let log = Arc::new(LogSink::new(encoder));

    let capture = Arc::new(match &config.capture_file {
        Some(path) => {
            info!("raw sample capture: {}", path.display());
            RawCapture::create(path)?
        }
        None => RawCapture::disabled(),
    });

    let shutdown = Shutdown::new(config.duration);

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping");
                shutdown.request_stop();
            }
        });
    }

    let source = RtlTcpSource::connect(&config.server)
        .with_context(|| format!("connecting to rtl_tcp server {}", config.server))?;

    let receiver = Receiver::new(&config, Box::new(source), log, capture, shutdown)?;

    let result = task::spawn_blocking(move || receiver.run())
        .await
        .context("receiver task panicked")?;

    if let Err(e) = &result {
        error!("receiver failed: {e:#}");
    } else {
        info!("receiver stopped");
    }
    result
}
