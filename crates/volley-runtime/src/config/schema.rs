//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use volley_core::{RequestOptions, RetryCount, Ttl};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VolleyConfig {
    /// Logging setup.
    pub logging: LoggingConfig,

    /// Ambient request options applied to every instance.
    pub defaults: RequestDefaults,
}

// =============================================================================
// Logging
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [Self; 5] = [Self::Trace, Self::Debug, Self::Info, Self::Warn, Self::Error];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown log level '{s}'"))
    }
}

/// Output line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to compact otherwise.
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanEventConfig {
    pub new: bool,
    pub enter: bool,
    pub exit: bool,
    pub close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    pub span_events: SpanEventConfig,
    pub thread_ids: bool,
    /// Include file and line of each event.
    pub file_location: bool,
    /// Target file for [`LogOutput::File`].
    pub file_path: Option<PathBuf>,
    /// Rotated daily; older files beyond this count are removed.
    pub max_files: u32,
    /// Per-module levels, e.g. `volley_core = "debug"`.
    pub filters: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stdout,
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            max_files: 5,
            filters: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Request defaults
// =============================================================================

/// Serializable subset of the request options.
///
/// Times are milliseconds; `-1` means "forever" for the cache times and
/// "unlimited" for the retry count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestDefaults {
    pub manual: Option<bool>,
    pub cache_time_ms: Option<i64>,
    pub stale_time_ms: Option<i64>,
    pub loading_delay_ms: Option<u64>,
    pub polling_interval_ms: Option<u64>,
    pub polling_error_retry_count: Option<u32>,
    pub polling_when_hidden: Option<bool>,
    pub retry_count: Option<i64>,
    pub retry_interval_ms: Option<u64>,
    pub debounce_wait_ms: Option<u64>,
    pub throttle_wait_ms: Option<u64>,
    pub refresh_on_window_focus: Option<bool>,
    pub cancel_on_window_blur: Option<bool>,
    pub focus_timespan_ms: Option<u64>,
}

impl RequestDefaults {
    /// Converts into ambient [`RequestOptions`]; unset keys stay unset.
    pub fn to_options(&self) -> RequestOptions {
        let ms = |v: Option<u64>| v.map(Duration::from_millis);
        RequestOptions {
            manual: self.manual,
            cache_time: self.cache_time_ms.map(Ttl::from_millis),
            stale_time: self.stale_time_ms.map(Ttl::from_millis),
            loading_delay: ms(self.loading_delay_ms),
            polling_interval: ms(self.polling_interval_ms),
            polling_error_retry_count: self.polling_error_retry_count,
            polling_when_hidden: self.polling_when_hidden,
            retry_count: self.retry_count.map(RetryCount::from_count),
            retry_interval: ms(self.retry_interval_ms),
            debounce_wait: ms(self.debounce_wait_ms),
            throttle_wait: ms(self.throttle_wait_ms),
            refresh_on_window_focus: self.refresh_on_window_focus,
            cancel_on_window_blur: self.cancel_on_window_blur,
            focus_timespan: ms(self.focus_timespan_ms),
            ..RequestOptions::new()
        }
    }
}
