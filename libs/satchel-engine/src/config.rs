use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use satchel_api::{OverflowPolicy, StorageOptions};

use crate::error::SatchelError;
use crate::filter::TopicFilter;

/// Root configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SatchelConfig {
    /// Default bag location and storage settings.
    #[serde(default)]
    pub storage: Option<StorageOptions>,

    #[serde(default)]
    pub record: RecordConfig,

    #[serde(default)]
    pub play: PlayConfig,
}

impl SatchelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, SatchelError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SatchelError::Config(format!("{path}: {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, SatchelError> {
        toml::from_str(toml_str).map_err(|e| SatchelError::Config(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecordConfig {
    /// Which channels to record. Must not be empty.
    #[serde(default)]
    pub filter: TopicFilter,

    /// Capacity of the queue between delivery callbacks and the writer.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// What a delivery callback does when the queue is full.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Longest a delivery callback blocks on a full queue before dropping.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,

    /// Channel discovery polling interval.
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// Retries of a failed append before the session is aborted.
    #[serde(default = "default_storage_retries")]
    pub storage_retries: u32,

    /// First retry delay; doubles on each further attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_queue_capacity() -> usize {
    1000
}
fn default_enqueue_timeout_ms() -> u64 {
    100
}
fn default_discovery_interval_ms() -> u64 {
    1000
}
fn default_storage_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    10
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            filter: TopicFilter::default(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
            storage_retries: default_storage_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl RecordConfig {
    pub fn with_filter(filter: TopicFilter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SatchelError> {
        if self.filter.is_empty() {
            return Err(SatchelError::Config(
                "no channels selected: set `all`, `topics`, `regex` or an exclusion".into(),
            ));
        }
        self.filter.compile()?;
        if self.queue_capacity == 0 {
            return Err(SatchelError::Config("queue_capacity must be at least 1".into()));
        }
        if self.discovery_interval_ms == 0 {
            return Err(SatchelError::Config("discovery_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// Play
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlayConfig {
    /// Which channels to publish. Empty = all.
    #[serde(default)]
    pub filter: TopicFilter,

    /// Playback speed multiplier; 1.0 reproduces the recorded timing.
    #[serde(default = "default_rate")]
    pub rate: f64,

    #[serde(default)]
    pub start_paused: bool,

    /// Restart from the beginning at end of bag.
    #[serde(default, rename = "loop")]
    pub loop_playback: bool,

    /// Records pre-read from storage ahead of the playback position.
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,

    /// Wait before the first publish.
    #[serde(default)]
    pub delay_ms: u64,

    /// Publish channel `from` under the name `to`.
    #[serde(default)]
    pub remap: BTreeMap<String, String>,
}

fn default_rate() -> f64 {
    1.0
}
fn default_read_ahead() -> usize {
    1000
}

impl Default for PlayConfig {
    fn default() -> Self {
        Self {
            filter: TopicFilter::default(),
            rate: default_rate(),
            start_paused: false,
            loop_playback: false,
            read_ahead: default_read_ahead(),
            delay_ms: 0,
            remap: BTreeMap::new(),
        }
    }
}

impl PlayConfig {
    pub fn validate(&self) -> Result<(), SatchelError> {
        validate_rate(self.rate)?;
        self.filter.compile()?;
        if self.read_ahead == 0 {
            return Err(SatchelError::Config("read_ahead must be at least 1".into()));
        }
        if let Some((from, _)) = self.remap.iter().find(|(_, to)| to.is_empty()) {
            return Err(SatchelError::Config(format!("remap of '{from}' has an empty target")));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Name a recorded channel is published under.
    pub fn remapped<'a>(&'a self, channel: &'a str) -> &'a str {
        self.remap.get(channel).map(String::as_str).unwrap_or(channel)
    }
}

pub(crate) fn validate_rate(rate: f64) -> Result<(), SatchelError> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(SatchelError::Config(format!("rate must be a positive number, got {rate}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Checks shared by every operation that takes storage options.
pub fn validate_storage(options: &StorageOptions) -> Result<(), SatchelError> {
    if options.uri.trim().is_empty() {
        return Err(SatchelError::Config("storage uri must not be empty".into()));
    }
    match options.compression_mode.as_str() {
        "" | "none" | "file" | "message" => {}
        other => {
            return Err(SatchelError::Config(format!(
                "unknown compression mode '{other}' (expected none, file or message)"
            )));
        }
    }
    let no_mode = matches!(options.compression_mode.as_str(), "" | "none");
    if !options.compression_format.is_empty() && no_mode {
        return Err(SatchelError::Config(
            "cannot specify a compression format without a compression mode".into(),
        ));
    }
    Ok(())
}
