//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::amr::DEFAULT_SYMBOL_LENGTH;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// rtl_tcp server address
    pub server: String,

    /// Message type selection: scm, idm, scm+idm, or r900
    pub msg_type: String,

    /// Samples per half-symbol
    pub symbol_length: usize,

    /// Log record format: text or json
    pub log_format: String,

    /// Log destination, stdout when unset
    pub log_file: Option<PathBuf>,

    /// Raw-sample capture destination, capture disabled when unset
    pub capture_file: Option<PathBuf>,

    /// Wall-clock run limit, unlimited when unset
    pub duration: Option<Duration>,

    /// Suppress repeated meter ids
    pub unique: bool,

    /// Keep only these meter ids (also the single-shot completion set)
    pub filter_ids: Vec<u32>,

    /// Keep only these meter types
    pub filter_types: Vec<u8>,

    /// Stop once every filtered meter id has been heard
    pub single: bool,

    /// Tuner overrides; the parser's defaults apply when unset
    pub center_freq: Option<u32>,
    pub sample_rate: Option<u32>,
    pub gain_db: Option<f32>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            server: std::env::var("RTLTCP_SERVER")
                .unwrap_or_else(|_| "127.0.0.1:1234".to_string()),

            msg_type: std::env::var("MSG_TYPE").unwrap_or_else(|_| "scm".to_string()),

            symbol_length: std::env::var("SYMBOL_LENGTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SYMBOL_LENGTH),

            log_format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),

            log_file: std::env::var("LOG_FILE").ok().map(PathBuf::from),

            capture_file: std::env::var("CAPTURE_FILE").ok().map(PathBuf::from),

            duration: std::env::var("DURATION_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),

            unique: flag(std::env::var("UNIQUE").ok().as_deref()),

            filter_ids: list(std::env::var("FILTER_ID").ok().as_deref()),

            filter_types: list(std::env::var("FILTER_TYPE").ok().as_deref()),

            single: flag(std::env::var("SINGLE").ok().as_deref()),

            center_freq: std::env::var("CENTER_FREQ").ok().and_then(|s| s.parse().ok()),

            sample_rate: std::env::var("SAMPLE_RATE").ok().and_then(|s| s.parse().ok()),

            gain_db: std::env::var("GAIN_DB").ok().and_then(|s| s.parse().ok()),
        }
    }
}

/// Interpret a boolean environment value
fn flag(value: Option<&str>) -> bool {
    matches!(value, Some(v) if v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Parse a comma-separated list, skipping empty entries. Malformed entries
/// are logged and skipped rather than discarding the whole list.
fn list<T: FromStr>(value: Option<&str>) -> Vec<T> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match s.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("ignoring unparsable filter entry {s:?}");
                None
            }
        })
        .collect()
}
