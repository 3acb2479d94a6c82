use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use satchel_api::{
    BagInfo, BagReader, BagWriter, ChannelDescriptor, MessageRecord, MetadataBuilder, StorageError,
    StorageOptions, StoragePort,
};

// ═══════════════════════════════════════════════════════════════
//  Stored bag
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default, Clone)]
struct StoredBag {
    channels: Vec<ChannelDescriptor>,
    /// In append order.
    records: Vec<MessageRecord>,
    metadata: Option<BagInfo>,
    open_writer: bool,
}

type Bags = Arc<Mutex<HashMap<String, StoredBag>>>;

fn lock(bags: &Bags) -> MutexGuard<'_, HashMap<String, StoredBag>> {
    bags.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("memory storage lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Records of a bag ordered by timestamp; ties keep append order.
fn ordered(records: &[MessageRecord]) -> Vec<MessageRecord> {
    let mut sorted = records.to_vec();
    sorted.sort_by_key(|r| r.timestamp_ns);
    sorted
}

// ═══════════════════════════════════════════════════════════════
//  MemoryStorage
// ═══════════════════════════════════════════════════════════════

/// Bags kept in process memory, keyed by uri. Cloning shares the bags.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    bags: Bags,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a finished bag without metadata, as if its writer had crashed
    /// before closing.
    pub fn insert_bag(&self, uri: &str, channels: Vec<ChannelDescriptor>, records: Vec<MessageRecord>) {
        lock(&self.bags).insert(
            uri.to_string(),
            StoredBag {
                channels,
                records,
                metadata: None,
                open_writer: false,
            },
        );
    }

    /// Records of `uri` in append order.
    pub fn records(&self, uri: &str) -> Option<Vec<MessageRecord>> {
        lock(&self.bags).get(uri).map(|bag| bag.records.clone())
    }

    pub fn channels(&self, uri: &str) -> Option<Vec<ChannelDescriptor>> {
        lock(&self.bags).get(uri).map(|bag| bag.channels.clone())
    }

    pub fn contains(&self, uri: &str) -> bool {
        lock(&self.bags).contains_key(uri)
    }
}

impl StoragePort for MemoryStorage {
    fn open_write(&self, options: &StorageOptions) -> Result<Box<dyn BagWriter>, StorageError> {
        let mut bags = lock(&self.bags);
        if bags.contains_key(&options.uri) {
            return Err(StorageError::AlreadyExists(options.uri.clone()));
        }
        bags.insert(
            options.uri.clone(),
            StoredBag {
                open_writer: true,
                ..StoredBag::default()
            },
        );
        tracing::debug!(uri = %options.uri, "memory bag created");
        Ok(Box::new(MemoryWriter {
            bags: self.bags.clone(),
            options: options.clone(),
            meta: MetadataBuilder::new(),
            closed: false,
        }))
    }

    fn open_read(&self, options: &StorageOptions) -> Result<Box<dyn BagReader>, StorageError> {
        let bags = lock(&self.bags);
        let bag = bags
            .get(&options.uri)
            .ok_or_else(|| StorageError::NotFound(options.uri.clone()))?;
        Ok(Box::new(MemoryReader {
            channels: bag.channels.clone(),
            records: ordered(&bag.records),
            cursor: 0,
        }))
    }

    fn reconstruct_metadata(&self, options: &StorageOptions) -> Result<BagInfo, StorageError> {
        let mut bags = lock(&self.bags);
        let bag = bags
            .get_mut(&options.uri)
            .ok_or_else(|| StorageError::NotFound(options.uri.clone()))?;
        if bag.open_writer {
            return Err(StorageError::Other(format!("bag '{}' is still being written", options.uri)));
        }
        let mut meta = MetadataBuilder::new();
        for channel in &bag.channels {
            meta.add_channel(channel);
        }
        for record in &bag.records {
            meta.add_message(record);
        }
        let info = meta.build(options);
        bag.metadata = Some(info.clone());
        Ok(info)
    }

    fn describe(&self, uri: &str) -> Result<BagInfo, StorageError> {
        let bags = lock(&self.bags);
        let bag = bags.get(uri).ok_or_else(|| StorageError::NotFound(uri.to_string()))?;
        bag.metadata
            .clone()
            .ok_or_else(|| StorageError::MissingMetadata(uri.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Writer / reader
// ═══════════════════════════════════════════════════════════════

struct MemoryWriter {
    bags: Bags,
    options: StorageOptions,
    meta: MetadataBuilder,
    closed: bool,
}

impl MemoryWriter {
    fn with_bag<T>(&self, f: impl FnOnce(&mut StoredBag) -> Result<T, StorageError>) -> Result<T, StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        let mut bags = lock(&self.bags);
        let bag = bags
            .get_mut(&self.options.uri)
            .ok_or_else(|| StorageError::NotFound(self.options.uri.clone()))?;
        f(bag)
    }
}

impl BagWriter for MemoryWriter {
    fn create_channel(&mut self, channel: &ChannelDescriptor) -> Result<(), StorageError> {
        self.with_bag(|bag| {
            if !bag.channels.iter().any(|c| c.name == channel.name) {
                bag.channels.push(channel.clone());
            }
            Ok(())
        })?;
        self.meta.add_channel(channel);
        Ok(())
    }

    fn append(&mut self, record: &MessageRecord) -> Result<(), StorageError> {
        self.with_bag(|bag| {
            if !bag.channels.iter().any(|c| c.name == record.channel) {
                return Err(StorageError::UnknownChannel(record.channel.clone()));
            }
            bag.records.push(record.clone());
            Ok(())
        })?;
        self.meta.add_message(record);
        Ok(())
    }

    fn close(&mut self) -> Result<BagInfo, StorageError> {
        let info = self.meta.build(&self.options);
        self.with_bag(|bag| {
            bag.metadata = Some(info.clone());
            bag.open_writer = false;
            Ok(())
        })?;
        self.closed = true;
        tracing::debug!(uri = %self.options.uri, messages = info.message_count, "memory bag closed");
        Ok(info)
    }
}

struct MemoryReader {
    channels: Vec<ChannelDescriptor>,
    records: Vec<MessageRecord>,
    cursor: usize,
}

impl BagReader for MemoryReader {
    fn channels(&self) -> Vec<ChannelDescriptor> {
        self.channels.clone()
    }

    fn next_record(&mut self) -> Result<Option<MessageRecord>, StorageError> {
        let record = self.records.get(self.cursor).cloned();
        if record.is_some() {
            self.cursor += 1;
        }
        Ok(record)
    }

    fn rewind(&mut self) -> Result<(), StorageError> {
        self.cursor = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan(name: &str) -> ChannelDescriptor {
        ChannelDescriptor::new(name, "std_msgs/String", "cdr")
    }

    #[test]
    fn write_close_describe() {
        let storage = MemoryStorage::new();
        let options = StorageOptions::new("bag");
        let mut writer = storage.open_write(&options).unwrap();
        writer.create_channel(&chan("a")).unwrap();
        writer.append(&MessageRecord::new("a", 20, vec![1])).unwrap();
        writer.append(&MessageRecord::new("a", 10, vec![2])).unwrap();

        assert!(matches!(storage.describe("bag"), Err(StorageError::MissingMetadata(_))));
        let info = writer.close().unwrap();
        assert_eq!(info.message_count, 2);
        assert_eq!(info.starting_time_ns, 10);
        assert_eq!(info.duration_ns, 10);
        assert_eq!(storage.describe("bag").unwrap(), info);
        assert!(matches!(writer.append(&MessageRecord::new("a", 30, vec![3])), Err(StorageError::Closed)));
    }

    #[test]
    fn append_requires_declared_channel() {
        let storage = MemoryStorage::new();
        let mut writer = storage.open_write(&StorageOptions::new("bag")).unwrap();
        let err = writer.append(&MessageRecord::new("ghost", 1, vec![0])).unwrap_err();
        assert!(matches!(err, StorageError::UnknownChannel(name) if name == "ghost"));
    }

    #[test]
    fn existing_bag_is_not_overwritten() {
        let storage = MemoryStorage::new();
        storage.insert_bag("bag", Vec::new(), Vec::new());
        assert!(matches!(
            storage.open_write(&StorageOptions::new("bag")),
            Err(StorageError::AlreadyExists(_))
        ));
    }

    #[test]
    fn reader_orders_by_timestamp_and_rewinds() {
        let storage = MemoryStorage::new();
        storage.insert_bag(
            "bag",
            vec![chan("a"), chan("b")],
            vec![
                MessageRecord::new("b", 5, vec![1]),
                MessageRecord::new("a", 1, vec![2]),
                MessageRecord::new("a", 5, vec![3]),
            ],
        );
        let mut reader = storage.open_read(&StorageOptions::new("bag")).unwrap();
        let mut order = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            order.push((r.channel, r.timestamp_ns));
        }
        // Equal timestamps keep append order.
        assert_eq!(order, vec![("a".to_string(), 1), ("b".to_string(), 5), ("a".to_string(), 5)]);

        reader.rewind().unwrap();
        assert_eq!(reader.next_record().unwrap().map(|r| r.timestamp_ns), Some(1));
    }

    #[test]
    fn reconstruct_then_describe() {
        let storage = MemoryStorage::new();
        storage.insert_bag(
            "bag",
            vec![chan("a"), chan("b")],
            vec![
                MessageRecord::new("a", 100, vec![0]),
                MessageRecord::new("b", 300, vec![0]),
                MessageRecord::new("a", 200, vec![0]),
            ],
        );
        let info = storage.reconstruct_metadata(&StorageOptions::new("bag")).unwrap();
        assert_eq!(info.message_count, 3);
        assert_eq!(info.starting_time_ns, 100);
        assert_eq!(info.duration_ns, 200);
        assert_eq!(info.channel("a").unwrap().message_count, 2);
        assert_eq!(storage.describe("bag").unwrap(), info);
    }

    #[test]
    fn missing_bag() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.open_read(&StorageOptions::new("nope")), Err(StorageError::NotFound(_))));
        assert!(matches!(storage.describe("nope"), Err(StorageError::NotFound(_))));
    }
}
