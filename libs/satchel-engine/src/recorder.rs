use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use satchel_api::{BagInfo, BagWriter, StorageError, StorageOptions, StoragePort, TransportPort};

use crate::config::{RecordConfig, validate_storage};
use crate::discovery::{DiscoveryReport, TopicDiscovery, spawn_discovery};
use crate::error::SatchelError;
use crate::orchestrator::BusyGuard;
use crate::queue::{QueueConsumer, QueueItem, record_queue};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of a finished recording session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    /// Messages appended to storage.
    pub written: u64,
    /// Messages dropped on a full queue.
    pub dropped: u64,
    /// Channels subscribed during the session.
    pub channels: Vec<String>,
    /// Failed discovery/subscribe calls.
    pub transport_errors: u64,
    /// Storage calls that succeeded only after a retry, or were retried in vain.
    pub storage_retries: u64,
    /// Metadata of the closed bag.
    pub bag: Option<BagInfo>,
}

/// Captures channels from the transport into storage.
pub struct Recorder {
    transport: Arc<dyn TransportPort>,
    storage: Arc<dyn StoragePort>,
    options: StorageOptions,
    config: RecordConfig,
    busy: Option<BusyGuard>,
}

impl Recorder {
    pub fn new(
        transport: Arc<dyn TransportPort>,
        storage: Arc<dyn StoragePort>,
        options: StorageOptions,
        config: RecordConfig,
    ) -> Self {
        Self {
            transport,
            storage,
            options,
            config,
            busy: None,
        }
    }

    /// Keep `guard` alive until the session task ends.
    pub(crate) fn hold(mut self, guard: BusyGuard) -> Self {
        self.busy = Some(guard);
        self
    }

    /// Open the bag, subscribe to the channels visible right now and start the
    /// writer and discovery tasks.
    ///
    /// The session runs until `stop` is cancelled, its handle is dropped or
    /// storage fails for good.
    /// Configuration and open errors are returned before anything is
    /// subscribed.
    pub async fn start(self, stop: CancellationToken) -> Result<RecordingSession, SatchelError> {
        self.config.validate()?;
        validate_storage(&self.options)?;
        let filter = self.config.filter.compile()?;

        let writer = self
            .storage
            .open_write(&self.options)
            .map_err(|e| e.with_context(format!("open bag '{}'", self.options.uri)))?;
        tracing::info!(uri = %self.options.uri, "recording started");

        let (producer, consumer) = record_queue(
            self.config.queue_capacity,
            self.config.overflow,
            self.config.enqueue_timeout(),
        );

        let retry = RetryPolicy {
            retries: self.config.storage_retries,
            backoff: self.config.retry_backoff(),
        };
        let writer_task = tokio::task::spawn_blocking(move || write_loop(writer, consumer, retry));

        let discovery_token = CancellationToken::new();
        let mut discovery = TopicDiscovery::new(
            self.transport.clone(),
            filter,
            producer,
            discovery_token.clone(),
        );
        if discovery.refresh().await.is_err() {
            tracing::warn!("writer stopped before discovery finished");
        }
        let discovery_task = spawn_discovery(
            discovery,
            self.config.discovery_interval(),
            discovery_token.clone(),
        );

        let stop = stop.child_token();
        let task = tokio::spawn(supervise(
            stop.clone(),
            discovery_token,
            discovery_task,
            writer_task,
            self.busy,
        ));
        Ok(RecordingSession { stop, task })
    }
}

/// Handle to a running recording. Dropping it stops the recording
/// gracefully.
pub struct RecordingSession {
    stop: CancellationToken,
    task: JoinHandle<Result<RecordSummary, SatchelError>>,
}

impl RecordingSession {
    /// Request a graceful stop. Queued records are still written.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to end (stop request or fatal storage error).
    pub async fn wait(mut self) -> Result<RecordSummary, SatchelError> {
        (&mut self.task).await?
    }

    pub async fn stop_and_wait(self) -> Result<RecordSummary, SatchelError> {
        self.stop();
        self.wait().await
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn supervise(
    stop: CancellationToken,
    discovery_token: CancellationToken,
    discovery_task: JoinHandle<DiscoveryReport>,
    mut writer_task: JoinHandle<WriterReport>,
    _busy: Option<BusyGuard>,
) -> Result<RecordSummary, SatchelError> {
    let early = tokio::select! {
        _ = stop.cancelled() => None,
        report = &mut writer_task => Some(report),
    };

    // Unsubscribing drops the callbacks and with them the last producers;
    // the writer then drains the queue and closes the bag.
    discovery_token.cancel();
    let discovery = discovery_task.await?;
    let writer = match early {
        Some(report) => report?,
        None => writer_task.await?,
    };

    let summary = RecordSummary {
        written: writer.written,
        dropped: writer.dropped,
        channels: discovery.channels,
        transport_errors: discovery.transport_errors,
        storage_retries: writer.retries,
        bag: writer.result.as_ref().ok().cloned(),
    };
    tracing::info!(
        written = summary.written,
        dropped = summary.dropped,
        channels = summary.channels.len(),
        transport_errors = summary.transport_errors,
        storage_retries = summary.storage_retries,
        "recording finished"
    );

    match writer.result {
        Ok(_) => Ok(summary),
        Err(e) => {
            tracing::error!(error = %e, "recording aborted by storage failure");
            Err(SatchelError::Storage(e))
        }
    }
}

// ---------------------------------------------------------------------------
// Writer loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// Run `op`, retrying failures with doubling backoff. Adds the number of
    /// retries made to `counter`.
    fn run<T>(
        &self,
        counter: &mut u64,
        mut op: impl FnMut() -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    *counter += 1;
                    tracing::warn!(attempt, retries = self.retries, error = %e, "storage call failed, retrying");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(MAX_RETRY_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug)]
struct WriterReport {
    written: u64,
    dropped: u64,
    retries: u64,
    result: Result<BagInfo, StorageError>,
}

/// Dequeue items one at a time and hand them to storage in dequeue order.
/// Returns when every producer is gone and the queue is empty, or on the
/// first storage failure that outlives its retries.
fn write_loop(mut writer: Box<dyn BagWriter>, consumer: QueueConsumer, retry: RetryPolicy) -> WriterReport {
    let mut written = 0;
    let mut retries = 0;

    while let Some(item) = consumer.recv() {
        let outcome = match &item {
            QueueItem::Channel(channel) => retry.run(&mut retries, || writer.create_channel(channel)),
            QueueItem::Message(record) => retry.run(&mut retries, || writer.append(record)),
        };
        match outcome {
            Ok(()) => {
                if matches!(item, QueueItem::Message(_)) {
                    written += 1;
                }
            }
            Err(e) => {
                if let Err(close_err) = writer.close() {
                    tracing::warn!(error = %close_err, "closing bag after failure also failed");
                }
                return WriterReport {
                    written,
                    dropped: consumer.dropped(),
                    retries,
                    result: Err(e),
                };
            }
        }
    }

    let result = retry.run(&mut retries, || writer.close());
    WriterReport {
        written,
        dropped: consumer.dropped(),
        retries,
        result,
    }
}
