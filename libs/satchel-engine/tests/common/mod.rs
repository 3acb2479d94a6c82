#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use satchel_api::{
    BagInfo, BagReader, BagWriter, ChannelDescriptor, DeliveryCallback, MessageRecord, PublisherHandle,
    StorageError, StorageOptions, StoragePort, SubscriptionHandle, TransportError, TransportPort,
};
use satchel_storage_memory::MemoryStorage;

pub const MS: i64 = 1_000_000;

pub fn chan(name: &str) -> ChannelDescriptor {
    ChannelDescriptor::new(name, "std_msgs/msg/String", "cdr")
}

pub fn msg(channel: &str, ts: i64, payload: &[u8]) -> MessageRecord {
    MessageRecord::new(channel, ts, payload.to_vec())
}

/// Memory storage preloaded with a bag under `uri`.
pub fn seeded(uri: &str, channels: &[&str], records: Vec<MessageRecord>) -> MemoryStorage {
    let storage = MemoryStorage::new();
    storage.insert_bag(uri, channels.iter().map(|c| chan(c)).collect(), records);
    storage
}

/// Records a=0, b=10ms, c=20ms.
pub fn three_channel_bag(uri: &str) -> MemoryStorage {
    seeded(
        uri,
        &["a", "b", "c"],
        vec![msg("a", 0, b"a0"), msg("b", 10 * MS, b"b10"), msg("c", 20 * MS, b"c20")],
    )
}

// ---------------------------------------------------------------------------
// Capturing transport
// ---------------------------------------------------------------------------

/// A publish observed by [`CaptureTransport`].
#[derive(Debug, Clone)]
pub struct Published {
    pub channel: String,
    pub timestamp_ns: i64,
    pub payload: Vec<u8>,
    pub at: Instant,
}

/// Transport that only publishes, recording every publish with the tokio
/// instant it happened at.
#[derive(Clone, Default)]
pub struct CaptureTransport {
    log: Arc<Mutex<Vec<Published>>>,
    fail_publish: Arc<Mutex<HashSet<String>>>,
    fail_advertise: Arc<Mutex<HashSet<String>>>,
}

impl CaptureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_publish(self, channel: &str) -> Self {
        self.fail_publish.lock().unwrap().insert(channel.to_string());
        self
    }

    pub fn failing_advertise(self, channel: &str) -> Self {
        self.fail_advertise.lock().unwrap().insert(channel.to_string());
        self
    }

    pub fn published(&self) -> Vec<Published> {
        self.log.lock().unwrap().clone()
    }

    pub fn channels(&self) -> Vec<String> {
        self.published().into_iter().map(|p| p.channel).collect()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.published().into_iter().map(|p| p.timestamp_ns).collect()
    }

    /// Publish instants relative to `origin`, in whole milliseconds.
    pub fn offsets_ms(&self, origin: Instant) -> Vec<u128> {
        self.published()
            .into_iter()
            .map(|p| p.at.duration_since(origin).as_millis())
            .collect()
    }
}

struct CapturePublisher {
    channel: String,
    fail: bool,
    log: Arc<Mutex<Vec<Published>>>,
}

impl PublisherHandle for CapturePublisher {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn publish(&self, record: &MessageRecord) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Publish {
                channel: self.channel.clone(),
                detail: "injected".into(),
            });
        }
        self.log.lock().unwrap().push(Published {
            channel: record.channel.clone(),
            timestamp_ns: record.timestamp_ns,
            payload: record.payload.to_vec(),
            at: Instant::now(),
        });
        Ok(())
    }
}

impl TransportPort for CaptureTransport {
    fn list_channels(&self) -> Result<Vec<ChannelDescriptor>, TransportError> {
        Ok(Vec::new())
    }

    fn subscribe(
        &self,
        channel: &ChannelDescriptor,
        _on_message: DeliveryCallback,
    ) -> Result<Box<dyn SubscriptionHandle>, TransportError> {
        Err(TransportError::ChannelNotFound(channel.name.clone()))
    }

    fn advertise(&self, channel: &ChannelDescriptor) -> Result<Box<dyn PublisherHandle>, TransportError> {
        if self.fail_advertise.lock().unwrap().contains(&channel.name) {
            return Err(TransportError::Publish {
                channel: channel.name.clone(),
                detail: "advertise refused".into(),
            });
        }
        Ok(Box::new(CapturePublisher {
            channel: channel.name.clone(),
            fail: self.fail_publish.lock().unwrap().contains(&channel.name),
            log: self.log.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Storage doubles
// ---------------------------------------------------------------------------

/// What a [`FaultyStorage`] does wrong.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Every append sleeps this long.
    SlowAppend(Duration),
    /// Every append fails.
    FailAppend,
    /// `next_record` fails once this many records were read.
    FailReadAfter(usize),
}

/// Wraps [`MemoryStorage`] and injects one fault.
#[derive(Clone)]
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    fault: Fault,
}

impl FaultyStorage {
    pub fn new(inner: MemoryStorage, fault: Fault) -> Self {
        Self { inner, fault }
    }
}

struct FaultyWriter {
    inner: Box<dyn BagWriter>,
    fault: Fault,
}

impl BagWriter for FaultyWriter {
    fn create_channel(&mut self, channel: &ChannelDescriptor) -> Result<(), StorageError> {
        self.inner.create_channel(channel)
    }

    fn append(&mut self, record: &MessageRecord) -> Result<(), StorageError> {
        match self.fault {
            Fault::SlowAppend(delay) => std::thread::sleep(delay),
            Fault::FailAppend => return Err(StorageError::Other("disk full".into())),
            Fault::FailReadAfter(_) => {}
        }
        self.inner.append(record)
    }

    fn close(&mut self) -> Result<BagInfo, StorageError> {
        self.inner.close()
    }
}

struct FaultyReader {
    inner: Box<dyn BagReader>,
    fail_after: Option<usize>,
    read: usize,
}

impl BagReader for FaultyReader {
    fn channels(&self) -> Vec<ChannelDescriptor> {
        self.inner.channels()
    }

    fn next_record(&mut self) -> Result<Option<MessageRecord>, StorageError> {
        if self.fail_after.is_some_and(|n| self.read >= n) {
            return Err(StorageError::Corrupt {
                location: "faulty".into(),
                detail: "injected read failure".into(),
            });
        }
        self.read += 1;
        self.inner.next_record()
    }

    fn rewind(&mut self) -> Result<(), StorageError> {
        self.inner.rewind()
    }
}

impl StoragePort for FaultyStorage {
    fn open_write(&self, options: &StorageOptions) -> Result<Box<dyn BagWriter>, StorageError> {
        Ok(Box::new(FaultyWriter {
            inner: self.inner.open_write(options)?,
            fault: self.fault,
        }))
    }

    fn open_read(&self, options: &StorageOptions) -> Result<Box<dyn BagReader>, StorageError> {
        let fail_after = match self.fault {
            Fault::FailReadAfter(n) => Some(n),
            _ => None,
        };
        Ok(Box::new(FaultyReader {
            inner: self.inner.open_read(options)?,
            fail_after,
            read: 0,
        }))
    }

    fn reconstruct_metadata(&self, options: &StorageOptions) -> Result<BagInfo, StorageError> {
        self.inner.reconstruct_metadata(options)
    }

    fn describe(&self, uri: &str) -> Result<BagInfo, StorageError> {
        self.inner.describe(uri)
    }
}

/// Poll `cond` every millisecond (real time) until it holds or `timeout`
/// passes.
pub async fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    cond()
}
