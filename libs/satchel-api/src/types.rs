use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Overflow Policy
// ════════════════════════════════════════════════════════════════

/// Стратегия поведения при переполнении bounded очереди записи.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// try_send(): при полной очереди сообщение дропается и учитывается.
    Drop,
    /// Ждать освобождения места не дольше таймаута, затем дропнуть.
    #[default]
    #[serde(alias = "backpressure")]
    BackPressure,
}

// ════════════════════════════════════════════════════════════════
//  Channel Descriptor
// ════════════════════════════════════════════════════════════════

/// Именованный типизированный канал pub/sub транспорта.
///
/// Идентичность определяется только `name`. После обнаружения не меняется.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub name: String,
    /// Идентификатор типа сообщения (e.g. `std_msgs/msg/String`).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Формат сериализации payload'а (e.g. `cdr`).
    pub serialization_format: String,
}

impl ChannelDescriptor {
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        serialization_format: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            serialization_format: serialization_format.into(),
        }
    }

    /// Copy of this descriptor published under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: self.type_name.clone(),
            serialization_format: self.serialization_format.clone(),
        }
    }
}

// ════════════════════════════════════════════════════════════════
//  MessageRecord
// ════════════════════════════════════════════════════════════════

/// Одно захваченное сообщение: канал, время отправки и opaque payload.
///
/// Ни engine, ни storage не интерпретируют `payload`. Payload хранится
/// в `Arc`, чтобы fan-out по подписчикам не копировал байты.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub channel: String,
    /// Монотонный timestamp в наносекундах.
    pub timestamp_ns: i64,
    pub payload: Arc<[u8]>,
}

impl MessageRecord {
    pub fn new(channel: impl Into<String>, timestamp_ns: i64, payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            channel: channel.into(),
            timestamp_ns,
            payload: payload.into(),
        }
    }
}
