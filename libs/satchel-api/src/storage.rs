use crate::error::StorageError;
use crate::metadata::{BagInfo, StorageOptions};
use crate::types::{ChannelDescriptor, MessageRecord};

/// Append side of an open bag.
///
/// Owned by exactly one writer task; never shared between threads at the
/// same time, hence `Send` without `Sync`.
pub trait BagWriter: Send {
    /// Declare a channel. Must precede the first `append` for that channel.
    fn create_channel(&mut self, channel: &ChannelDescriptor) -> Result<(), StorageError>;

    /// Append one record after all previously appended ones.
    fn append(&mut self, record: &MessageRecord) -> Result<(), StorageError>;

    /// Flush and finalize the bag (metadata included).
    fn close(&mut self) -> Result<BagInfo, StorageError>;
}

/// Read side of an open bag.
pub trait BagReader: Send {
    /// Channels declared in the bag.
    fn channels(&self) -> Vec<ChannelDescriptor>;

    /// Next record in non-decreasing timestamp order; `None` at end of bag.
    fn next_record(&mut self) -> Result<Option<MessageRecord>, StorageError>;

    /// Restart the sequence from the first record.
    fn rewind(&mut self) -> Result<(), StorageError>;
}

/// Storage backend.
///
/// The engine doesn't know concrete implementations; for it, storage is just
/// this trait. `reconstruct_metadata` and `describe` are single-pass
/// inspection routines used by the reindex and info operations.
pub trait StoragePort: Send + Sync {
    fn open_write(&self, options: &StorageOptions) -> Result<Box<dyn BagWriter>, StorageError>;

    fn open_read(&self, options: &StorageOptions) -> Result<Box<dyn BagReader>, StorageError>;

    /// Rebuild bag metadata from the stored records and persist it.
    fn reconstruct_metadata(&self, options: &StorageOptions) -> Result<BagInfo, StorageError>;

    /// Read the persisted metadata of the bag at `uri`.
    fn describe(&self, uri: &str) -> Result<BagInfo, StorageError>;
}
