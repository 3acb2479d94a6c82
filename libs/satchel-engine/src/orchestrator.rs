//! Facade over the four mutually exclusive operations.
//!
//! Idle → {Recording, Playing, Reindexing, Inspecting} → Idle. A second
//! operation started while one is running is rejected with
//! [`SatchelError::Busy`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use satchel_api::{BagInfo, StorageOptions, StoragePort, TransportPort};

use crate::config::{PlayConfig, RecordConfig, validate_storage};
use crate::error::SatchelError;
use crate::player::{PlaybackSession, PlaybackSummary, Player};
use crate::recorder::{RecordSummary, Recorder, RecordingSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Recording,
    Playing,
    Reindexing,
    Inspecting,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Recording => "recording",
            Operation::Playing => "playing",
            Operation::Reindexing => "reindexing",
            Operation::Inspecting => "inspecting",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Busy state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BusyState {
    current: Mutex<Option<Operation>>,
}

impl BusyState {
    fn lock(&self) -> MutexGuard<'_, Option<Operation>> {
        self.current.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("orchestrator state lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

/// Holds the orchestrator busy until dropped.
#[derive(Debug)]
pub(crate) struct BusyGuard {
    state: Arc<BusyState>,
    operation: Operation,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        *self.state.lock() = None;
        tracing::debug!(operation = %self.operation, "orchestrator idle");
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs one operation at a time against injected storage and transport.
#[derive(Clone)]
pub struct Orchestrator {
    storage: Arc<dyn StoragePort>,
    transport: Option<Arc<dyn TransportPort>>,
    state: Arc<BusyState>,
}

impl Orchestrator {
    pub fn new(storage: Arc<dyn StoragePort>, transport: Arc<dyn TransportPort>) -> Self {
        Self {
            storage,
            transport: Some(transport),
            state: Arc::new(BusyState::default()),
        }
    }

    /// Orchestrator without a transport: only `reindex` and `bag_info`
    /// are available.
    pub fn for_storage(storage: Arc<dyn StoragePort>) -> Self {
        Self {
            storage,
            transport: None,
            state: Arc::new(BusyState::default()),
        }
    }

    /// Operation in progress, if any.
    pub fn current(&self) -> Option<Operation> {
        *self.state.lock()
    }

    fn acquire(&self, operation: Operation) -> Result<BusyGuard, SatchelError> {
        let mut current = self.state.lock();
        if let Some(active) = *current {
            tracing::warn!(active = %active, requested = %operation, "operation rejected, orchestrator busy");
            return Err(SatchelError::Busy(active));
        }
        *current = Some(operation);
        tracing::debug!(operation = %operation, "orchestrator busy");
        Ok(BusyGuard {
            state: self.state.clone(),
            operation,
        })
    }

    fn transport(&self) -> Result<Arc<dyn TransportPort>, SatchelError> {
        self.transport
            .clone()
            .ok_or_else(|| SatchelError::Config("no transport configured for this operation".into()))
    }

    /// Record until `stop` is cancelled or storage fails.
    pub async fn record(
        &self,
        options: StorageOptions,
        config: RecordConfig,
        stop: CancellationToken,
    ) -> Result<RecordSummary, SatchelError> {
        self.begin_record(options, config, stop).await?.wait().await
    }

    /// Start recording and hand back the live session. The orchestrator
    /// stays busy until the session task ends; dropping the handle stops it.
    pub async fn begin_record(
        &self,
        options: StorageOptions,
        config: RecordConfig,
        stop: CancellationToken,
    ) -> Result<RecordingSession, SatchelError> {
        let guard = self.acquire(Operation::Recording)?;
        Recorder::new(self.transport()?, self.storage.clone(), options, config)
            .hold(guard)
            .start(stop)
            .await
    }

    /// Play the bag until it ends, `stop` is cancelled or a read fails.
    pub async fn play(
        &self,
        options: StorageOptions,
        config: PlayConfig,
        stop: CancellationToken,
    ) -> Result<PlaybackSummary, SatchelError> {
        self.begin_play(options, config, stop).await?.wait().await
    }

    pub async fn begin_play(
        &self,
        options: StorageOptions,
        config: PlayConfig,
        stop: CancellationToken,
    ) -> Result<PlaybackSession, SatchelError> {
        let guard = self.acquire(Operation::Playing)?;
        Player::new(self.transport()?, self.storage.clone(), options, config)
            .hold(guard)
            .start(stop)
            .await
    }

    /// Rebuild the bag metadata from its stored records.
    pub fn reindex(&self, options: &StorageOptions) -> Result<BagInfo, SatchelError> {
        let _guard = self.acquire(Operation::Reindexing)?;
        validate_storage(options)?;
        tracing::info!(uri = %options.uri, "reindexing bag");
        let info = self
            .storage
            .reconstruct_metadata(options)
            .map_err(|e| e.with_context(format!("reindex '{}'", options.uri)))?;
        tracing::info!(
            uri = %options.uri,
            messages = info.message_count,
            channels = info.channels.len(),
            "reindex finished"
        );
        Ok(info)
    }

    /// Read the bag's metadata.
    pub fn bag_info(&self, uri: &str) -> Result<BagInfo, SatchelError> {
        let _guard = self.acquire(Operation::Inspecting)?;
        if uri.trim().is_empty() {
            return Err(SatchelError::Config("bag uri must not be empty".into()));
        }
        let info = self
            .storage
            .describe(uri)
            .map_err(|e| e.with_context(format!("describe '{uri}'")))?;
        Ok(info)
    }
}
