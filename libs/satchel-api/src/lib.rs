pub mod error;
pub mod metadata;
pub mod storage;
pub mod transport;
pub mod types;
pub mod util;

pub use error::{StorageError, TransportError};
pub use metadata::{BagInfo, ChannelInfo, MetadataBuilder, StorageOptions};
pub use storage::{BagReader, BagWriter, StoragePort};
pub use transport::{DeliveryCallback, PublisherHandle, SubscriptionHandle, TransportPort};
pub use types::{ChannelDescriptor, MessageRecord, OverflowPolicy};
pub use util::now_ns;
