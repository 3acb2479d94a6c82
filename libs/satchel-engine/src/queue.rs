//! Bounded multi-producer / single-consumer queue between transport delivery
//! callbacks and the recorder's writer.
//!
//! Producers run on transport threads and must never stall them for long:
//! under [`OverflowPolicy::BackPressure`] a full queue blocks the producer up
//! to a timeout, under [`OverflowPolicy::Drop`] not at all. Either way a record
//! that does not fit is dropped and counted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};

use satchel_api::{ChannelDescriptor, MessageRecord, OverflowPolicy};

/// Log every n-th drop after the first.
const DROP_LOG_EVERY: u64 = 1000;

/// Unit of work for the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    /// A channel must be declared to storage before its first message.
    Channel(ChannelDescriptor),
    Message(MessageRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue full, record dropped")]
    Full,
    #[error("queue closed")]
    Closed,
}

#[derive(Debug, Default)]
struct QueueStats {
    dropped: AtomicU64,
}

/// Create a queue holding at most `capacity` items.
pub fn record_queue(
    capacity: usize,
    overflow: OverflowPolicy,
    enqueue_timeout: Duration,
) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let stats = Arc::new(QueueStats::default());
    (
        QueueProducer {
            tx,
            overflow,
            enqueue_timeout,
            stats: stats.clone(),
        },
        QueueConsumer { rx, stats },
    )
}

// ═══════════════════════════════════════════════════════════════
//  Producer
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: Sender<QueueItem>,
    overflow: OverflowPolicy,
    enqueue_timeout: Duration,
    stats: Arc<QueueStats>,
}

impl QueueProducer {
    /// Enqueue a delivered message according to the overflow policy.
    pub fn enqueue(&self, record: MessageRecord) -> Result<(), EnqueueError> {
        let item = QueueItem::Message(record);
        let outcome = match self.overflow {
            OverflowPolicy::Drop => match self.tx.try_send(item) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(item)) => Err(item),
                Err(TrySendError::Disconnected(_)) => return Err(EnqueueError::Closed),
            },
            OverflowPolicy::BackPressure => match self.tx.send_timeout(item, self.enqueue_timeout) {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(item)) => Err(item),
                Err(SendTimeoutError::Disconnected(_)) => return Err(EnqueueError::Closed),
            },
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(QueueItem::Message(record)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_EVERY == 0 {
                    tracing::warn!(
                        channel = %record.channel,
                        dropped,
                        "record queue full, dropping message"
                    );
                }
                Err(EnqueueError::Full)
            }
            Err(QueueItem::Channel(_)) => Err(EnqueueError::Full),
        }
    }

    /// Non-blocking attempt to enqueue a channel registration.
    ///
    /// Registrations are never dropped: on `Full` the caller gets the
    /// descriptor back and retries.
    pub fn try_register(&self, channel: ChannelDescriptor) -> Result<(), (ChannelDescriptor, EnqueueError)> {
        match self.tx.try_send(QueueItem::Channel(channel.clone())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err((channel, EnqueueError::Full)),
            Err(TrySendError::Disconnected(_)) => Err((channel, EnqueueError::Closed)),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════
//  Consumer
// ═══════════════════════════════════════════════════════════════

/// Single consumer side. Not `Clone`: only the writer dequeues.
#[derive(Debug)]
pub struct QueueConsumer {
    rx: Receiver<QueueItem>,
    stats: Arc<QueueStats>,
}

impl QueueConsumer {
    /// Block until an item arrives. `None` once every producer is gone and
    /// the queue is drained.
    pub fn recv(&self) -> Option<QueueItem> {
        self.rx.recv().ok()
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}
