use std::sync::Arc;

use crate::error::TransportError;
use crate::types::{ChannelDescriptor, MessageRecord};

/// Delivery callback registered with [`TransportPort::subscribe`].
///
/// Invoked on transport-owned threads. Calls for one channel never overlap;
/// calls for different channels may.
pub type DeliveryCallback = Arc<dyn Fn(MessageRecord) + Send + Sync>;

/// Live subscription. Dropping it unsubscribes: once `drop` returns the
/// transport starts no new callback invocations for it.
pub trait SubscriptionHandle: Send {
    fn channel(&self) -> &str;
}

/// Advertised publisher on one channel.
pub trait PublisherHandle: Send + Sync {
    fn channel(&self) -> &str;

    fn publish(&self, record: &MessageRecord) -> Result<(), TransportError>;
}

/// Pub/sub node.
pub trait TransportPort: Send + Sync {
    /// Channels currently visible on the graph.
    fn list_channels(&self) -> Result<Vec<ChannelDescriptor>, TransportError>;

    fn subscribe(
        &self,
        channel: &ChannelDescriptor,
        on_message: DeliveryCallback,
    ) -> Result<Box<dyn SubscriptionHandle>, TransportError>;

    fn advertise(&self, channel: &ChannelDescriptor) -> Result<Box<dyn PublisherHandle>, TransportError>;
}
