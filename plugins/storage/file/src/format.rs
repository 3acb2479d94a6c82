// ════════════════════════════════════════════════════════════════
//  On-disk line formats
// ════════════════════════════════════════════════════════════════

use std::sync::Arc;

use satchel_api::{ChannelDescriptor, MessageRecord, StorageError};

/// Имя файла метаданных внутри директории bag'а.
pub const METADATA_FILE: &str = "metadata.json";

/// Расширение data-файлов.
pub(crate) const DATA_EXT: &str = "jsonl";

/// Одна строка data-файла.
///
/// Каналы объявляются в каждом файле до первого сообщения этого канала,
/// поэтому любой data-файл читается независимо от остальных.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum DiskLine {
    Channel {
        name: String,
        #[serde(rename = "type")]
        type_name: String,
        serialization_format: String,
    },
    Message {
        channel: String,
        timestamp_ns: i64,
        #[serde(with = "payload_b64")]
        payload: Vec<u8>,
    },
}

impl DiskLine {
    pub(crate) fn channel(channel: &ChannelDescriptor) -> Self {
        DiskLine::Channel {
            name: channel.name.clone(),
            type_name: channel.type_name.clone(),
            serialization_format: channel.serialization_format.clone(),
        }
    }

    pub(crate) fn message(record: &MessageRecord) -> Self {
        DiskLine::Message {
            channel: record.channel.clone(),
            timestamp_ns: record.timestamp_ns,
            payload: record.payload.to_vec(),
        }
    }

    pub(crate) fn to_line(&self) -> Result<String, StorageError> {
        serde_json::to_string(self).map_err(|e| StorageError::Other(format!("json serialize: {e}")))
    }

    /// Распарсить строку; `location` попадает в ошибку.
    pub(crate) fn parse(line: &str, location: impl FnOnce() -> String) -> Result<Self, StorageError> {
        serde_json::from_str(line).map_err(|e| StorageError::Corrupt {
            location: location(),
            detail: e.to_string(),
        })
    }
}

/// Восстановить запись из строки `Message`.
pub(crate) fn into_record(line: DiskLine) -> Option<MessageRecord> {
    match line {
        DiskLine::Message {
            channel,
            timestamp_ns,
            payload,
        } => Some(MessageRecord {
            channel,
            timestamp_ns,
            payload: Arc::from(payload),
        }),
        DiskLine::Channel { .. } => None,
    }
}

/// Payload как base64-строка (standard alphabet, с padding).
mod payload_b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
