use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use satchel_api::{ChannelDescriptor, DeliveryCallback, SubscriptionHandle, TransportPort};

use crate::filter::ChannelFilter;
use crate::queue::{EnqueueError, QueueProducer};

/// Pause between attempts to register a channel while the queue is full.
const REGISTER_RETRY: Duration = Duration::from_millis(1);

/// What discovery did over the lifetime of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Subscribed channels, in subscription order.
    pub channels: Vec<String>,
    /// Failed list/subscribe calls.
    pub transport_errors: u64,
}

/// Poll-and-diff tracker of the live channel set.
///
/// Each `refresh` lists the transport's channels, skips names seen before,
/// and for new names passing the filter registers the channel with the
/// writer queue and subscribes a callback feeding that queue.
pub struct TopicDiscovery {
    transport: Arc<dyn TransportPort>,
    filter: ChannelFilter,
    producer: QueueProducer,
    cancel: CancellationToken,
    seen: HashSet<String>,
    registered: HashSet<String>,
    subscriptions: HashMap<String, Box<dyn SubscriptionHandle>>,
    report: DiscoveryReport,
}

impl TopicDiscovery {
    pub fn new(
        transport: Arc<dyn TransportPort>,
        filter: ChannelFilter,
        producer: QueueProducer,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            filter,
            producer,
            cancel,
            seen: HashSet::new(),
            registered: HashSet::new(),
            subscriptions: HashMap::new(),
            report: DiscoveryReport::default(),
        }
    }

    /// One discovery pass. Returns the channels subscribed by this pass.
    ///
    /// Transport failures are logged and counted, never returned. The only
    /// error is a closed queue, meaning the writer is gone.
    pub async fn refresh(&mut self) -> Result<Vec<ChannelDescriptor>, EnqueueError> {
        let live = match self.transport.list_channels() {
            Ok(live) => live,
            Err(e) => {
                self.report.transport_errors += 1;
                tracing::warn!(error = %e, "channel discovery failed, retrying next tick");
                return Ok(Vec::new());
            }
        };

        let mut added = Vec::new();
        for channel in live {
            if self.seen.contains(&channel.name) {
                continue;
            }
            if channel.type_name.is_empty() {
                tracing::debug!(channel = %channel.name, "channel has no type yet, skipping");
                continue;
            }
            self.seen.insert(channel.name.clone());
            if !self.filter.matches(&channel.name) {
                tracing::debug!(channel = %channel.name, "channel filtered out");
                continue;
            }

            if !self.registered.contains(&channel.name) {
                register(&self.producer, &self.cancel, channel.clone()).await?;
                self.registered.insert(channel.name.clone());
            }

            let producer = self.producer.clone();
            let callback: DeliveryCallback = Arc::new(move |record| {
                if let Err(EnqueueError::Closed) = producer.enqueue(record) {
                    tracing::trace!("writer gone, discarding delivery");
                }
            });

            match self.transport.subscribe(&channel, callback) {
                Ok(handle) => {
                    tracing::info!(
                        channel = %channel.name,
                        type_name = %channel.type_name,
                        "subscribed to channel"
                    );
                    self.subscriptions.insert(channel.name.clone(), handle);
                    self.report.channels.push(channel.name.clone());
                    added.push(channel);
                }
                Err(e) => {
                    self.report.transport_errors += 1;
                    // Forget it so the next tick tries again.
                    self.seen.remove(&channel.name);
                    tracing::warn!(channel = %channel.name, error = %e, "subscription failed, skipping channel");
                }
            }
        }
        Ok(added)
    }

    /// Drop every subscription and return the session report.
    pub fn close(mut self) -> DiscoveryReport {
        for (name, handle) in self.subscriptions.drain() {
            drop(handle);
            tracing::debug!(channel = %name, "unsubscribed");
        }
        self.report
    }
}

/// Enqueue a channel registration, waiting while the queue is full.
async fn register(
    producer: &QueueProducer,
    cancel: &CancellationToken,
    mut channel: ChannelDescriptor,
) -> Result<(), EnqueueError> {
    loop {
        match producer.try_register(channel) {
            Ok(()) => return Ok(()),
            Err((_, EnqueueError::Closed)) => return Err(EnqueueError::Closed),
            Err((back, EnqueueError::Full)) => {
                if cancel.is_cancelled() {
                    return Err(EnqueueError::Closed);
                }
                channel = back;
                tokio::time::sleep(REGISTER_RETRY).await;
            }
        }
    }
}

/// Run `discovery` every `interval` until `token` is cancelled or the writer
/// queue closes. The first tick comes one interval after the call.
pub fn spawn_discovery(
    mut discovery: TopicDiscovery,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<DiscoveryReport> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if discovery.refresh().await.is_err() {
                        tracing::warn!("record queue closed, stopping discovery");
                        break;
                    }
                }
            }
        }
        discovery.close()
    })
}
