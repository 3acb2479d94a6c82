use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{ChannelDescriptor, MessageRecord};

/// Current version of the bag metadata layout.
pub const METADATA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Storage options
// ---------------------------------------------------------------------------

/// Where and how a bag is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Bag location (a directory for the file storage, a key for memory).
    pub uri: String,

    /// Storage backend identifier.
    #[serde(default = "default_storage_id")]
    pub storage_id: String,

    /// Start a new data file after this many messages. 0 = never split.
    #[serde(default)]
    pub max_records_per_file: u64,

    /// Compression algorithm recorded in metadata (e.g. "zstd"). Empty = none.
    #[serde(default)]
    pub compression_format: String,

    /// Compression granularity: "", "none", "file" or "message".
    #[serde(default)]
    pub compression_mode: String,

    /// Write reconstructed metadata here instead of into the bag.
    #[serde(default)]
    pub metadata_dir: Option<PathBuf>,
}

fn default_storage_id() -> String {
    "jsonl".into()
}

impl StorageOptions {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            storage_id: default_storage_id(),
            max_records_per_file: 0,
            compression_format: String::new(),
            compression_mode: String::new(),
            metadata_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Bag info
// ---------------------------------------------------------------------------

/// Per-channel summary inside [`BagInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub channel: ChannelDescriptor,
    pub message_count: u64,
}

/// Bag metadata: what a writer records on close and `describe` reads back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagInfo {
    pub version: u32,
    pub storage_identifier: String,
    pub uri: String,
    pub relative_file_paths: Vec<String>,
    /// Earliest message timestamp (0 for an empty bag).
    pub starting_time_ns: i64,
    /// Latest minus earliest message timestamp.
    pub duration_ns: i64,
    pub message_count: u64,
    pub channels: Vec<ChannelInfo>,
    #[serde(default)]
    pub compression_format: String,
    #[serde(default)]
    pub compression_mode: String,
}

impl BagInfo {
    pub fn channel(&self, name: &str) -> Option<&ChannelInfo> {
        self.channels.iter().find(|c| c.channel.name == name)
    }
}

/// Accumulates channel and message statistics into a [`BagInfo`].
///
/// Channels keep their registration order; a message for an unregistered
/// channel is still counted, with an empty descriptor.
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    order: Vec<String>,
    channels: BTreeMap<String, ChannelInfo>,
    min_ts: Option<i64>,
    max_ts: Option<i64>,
    message_count: u64,
    files: Vec<String>,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_channel(&mut self, channel: &ChannelDescriptor) {
        if self.channels.contains_key(&channel.name) {
            return;
        }
        self.order.push(channel.name.clone());
        self.channels.insert(
            channel.name.clone(),
            ChannelInfo {
                channel: channel.clone(),
                message_count: 0,
            },
        );
    }

    pub fn add_message(&mut self, record: &MessageRecord) {
        if !self.channels.contains_key(&record.channel) {
            self.add_channel(&ChannelDescriptor::new(record.channel.clone(), "", ""));
        }
        if let Some(info) = self.channels.get_mut(&record.channel) {
            info.message_count += 1;
        }
        self.message_count += 1;
        self.min_ts = Some(self.min_ts.map_or(record.timestamp_ns, |t| t.min(record.timestamp_ns)));
        self.max_ts = Some(self.max_ts.map_or(record.timestamp_ns, |t| t.max(record.timestamp_ns)));
    }

    pub fn add_file(&mut self, relative_path: impl Into<String>) {
        let path = relative_path.into();
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }

    pub fn build(&self, options: &StorageOptions) -> BagInfo {
        let starting_time_ns = self.min_ts.unwrap_or(0);
        let duration_ns = match (self.min_ts, self.max_ts) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        };
        BagInfo {
            version: METADATA_VERSION,
            storage_identifier: options.storage_id.clone(),
            uri: options.uri.clone(),
            relative_file_paths: self.files.clone(),
            starting_time_ns,
            duration_ns,
            message_count: self.message_count,
            channels: self
                .order
                .iter()
                .filter_map(|name| self.channels.get(name).cloned())
                .collect(),
            compression_format: options.compression_format.clone(),
            compression_mode: options.compression_mode.clone(),
        }
    }
}
