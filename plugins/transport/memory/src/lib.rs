use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use satchel_api::{
    ChannelDescriptor, DeliveryCallback, MessageRecord, PublisherHandle, SubscriptionHandle, TransportError,
    TransportPort, now_ns,
};

// ═══════════════════════════════════════════════════════════════
//  Channel state
// ═══════════════════════════════════════════════════════════════

struct BusChannel {
    descriptor: ChannelDescriptor,
    subscribers: Mutex<Vec<(u64, DeliveryCallback)>>,
    /// Held for the whole fan-out of one message: deliveries on a channel
    /// never overlap, and unsubscribe waits for the one in flight.
    delivery: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("bus lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[derive(Default)]
struct BusInner {
    channels: RwLock<BTreeMap<String, Arc<BusChannel>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn get(&self, name: &str) -> Option<Arc<BusChannel>> {
        let guard = match self.channels.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("bus registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        guard.get(name).cloned()
    }

    fn declare(&self, descriptor: &ChannelDescriptor) -> Result<Arc<BusChannel>, TransportError> {
        let mut guard = match self.channels.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("bus registry write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        if let Some(existing) = guard.get(&descriptor.name) {
            check_type(&existing.descriptor, &descriptor.type_name)?;
            return Ok(existing.clone());
        }
        let channel = Arc::new(BusChannel {
            descriptor: descriptor.clone(),
            subscribers: Mutex::new(Vec::new()),
            delivery: Mutex::new(()),
        });
        guard.insert(descriptor.name.clone(), channel.clone());
        tracing::debug!(channel = %descriptor.name, type_name = %descriptor.type_name, "channel declared");
        Ok(channel)
    }

    fn deliver(&self, channel: &BusChannel, record: MessageRecord) -> usize {
        let _in_flight = lock(&channel.delivery);
        let targets: Vec<DeliveryCallback> = lock(&channel.subscribers).iter().map(|(_, cb)| cb.clone()).collect();
        for callback in &targets {
            callback(record.clone());
        }
        targets.len()
    }
}

fn check_type(existing: &ChannelDescriptor, requested: &str) -> Result<(), TransportError> {
    if requested.is_empty() || existing.type_name == requested {
        return Ok(());
    }
    Err(TransportError::TypeMismatch {
        channel: existing.name.clone(),
        existing: existing.type_name.clone(),
        requested: requested.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════════
//  MemoryBus
// ═══════════════════════════════════════════════════════════════

/// In-process pub/sub bus.
///
/// Channels appear when declared or advertised. Subscriber callbacks run on
/// the publishing thread. Cloning shares the bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a channel visible. Re-declaring with the same type is a no-op.
    pub fn declare(&self, descriptor: &ChannelDescriptor) -> Result<(), TransportError> {
        self.inner.declare(descriptor).map(|_| ())
    }

    /// Publish stamped with the current time. Returns the number of
    /// subscribers reached.
    pub fn publish(&self, channel: &str, payload: impl Into<Arc<[u8]>>) -> Result<usize, TransportError> {
        self.publish_at(channel, now_ns(), payload)
    }

    /// Publish with an explicit timestamp.
    pub fn publish_at(
        &self,
        channel: &str,
        timestamp_ns: i64,
        payload: impl Into<Arc<[u8]>>,
    ) -> Result<usize, TransportError> {
        let state = self
            .inner
            .get(channel)
            .ok_or_else(|| TransportError::ChannelNotFound(channel.to_string()))?;
        Ok(self.inner.deliver(&state, MessageRecord::new(channel, timestamp_ns, payload)))
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .get(channel)
            .map(|state| lock(&state.subscribers).len())
            .unwrap_or(0)
    }
}

impl TransportPort for MemoryBus {
    fn list_channels(&self) -> Result<Vec<ChannelDescriptor>, TransportError> {
        let guard = match self.inner.channels.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("bus registry read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        };
        Ok(guard.values().map(|c| c.descriptor.clone()).collect())
    }

    fn subscribe(
        &self,
        channel: &ChannelDescriptor,
        on_message: DeliveryCallback,
    ) -> Result<Box<dyn SubscriptionHandle>, TransportError> {
        let state = self
            .inner
            .get(&channel.name)
            .ok_or_else(|| TransportError::ChannelNotFound(channel.name.clone()))?;
        check_type(&state.descriptor, &channel.type_name)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&state.subscribers).push((id, on_message));
        tracing::debug!(channel = %channel.name, id, "subscribed");
        Ok(Box::new(BusSubscription { channel: state, id }))
    }

    fn advertise(&self, channel: &ChannelDescriptor) -> Result<Box<dyn PublisherHandle>, TransportError> {
        let state = self.inner.declare(channel)?;
        Ok(Box::new(BusPublisher {
            inner: self.inner.clone(),
            channel: state,
        }))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Handles
// ═══════════════════════════════════════════════════════════════

/// Dropping unsubscribes. Must not be dropped from inside a callback of the
/// same channel.
pub struct BusSubscription {
    channel: Arc<BusChannel>,
    id: u64,
}

impl SubscriptionHandle for BusSubscription {
    fn channel(&self) -> &str {
        &self.channel.descriptor.name
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        lock(&self.channel.subscribers).retain(|(id, _)| *id != self.id);
        // Wait out a delivery that snapshotted us before removal.
        drop(lock(&self.channel.delivery));
        tracing::debug!(channel = %self.channel.descriptor.name, id = self.id, "unsubscribed");
    }
}

/// Publishes on one channel. Records are re-stamped with the send time.
pub struct BusPublisher {
    inner: Arc<BusInner>,
    channel: Arc<BusChannel>,
}

impl PublisherHandle for BusPublisher {
    fn channel(&self) -> &str {
        &self.channel.descriptor.name
    }

    fn publish(&self, record: &MessageRecord) -> Result<(), TransportError> {
        let outgoing = MessageRecord {
            channel: self.channel.descriptor.name.clone(),
            timestamp_ns: now_ns(),
            payload: record.payload.clone(),
        };
        self.inner.deliver(&self.channel, outgoing);
        Ok(())
    }
}
