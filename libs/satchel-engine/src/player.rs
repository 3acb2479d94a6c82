//! Timed playback of a bag onto the transport.
//!
//! One tokio task owns the publishers and the clock. It sleeps until the
//! deadline of the next look-ahead record, or until a control command, a
//! finished read or the stop token wakes it, and publishes one record per
//! wake-up. Storage reads run in batches on the blocking pool and refill the
//! look-ahead window while the task waits for deadlines.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use satchel_api::{BagReader, MessageRecord, PublisherHandle, StorageError, StorageOptions, StoragePort, TransportPort};

use crate::clock::PlaybackClock;
use crate::config::{PlayConfig, validate_rate, validate_storage};
use crate::error::SatchelError;
use crate::orchestrator::BusyGuard;

/// How a playback session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Reached the end of the bag.
    Completed,
    /// Stopped on request.
    Stopped,
}

impl fmt::Display for PlaybackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackOutcome::Completed => f.write_str("completed"),
            PlaybackOutcome::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub published: u64,
    /// Records of channels that are filtered out or could not be advertised.
    pub skipped: u64,
    pub publish_failures: u64,
    /// Completed passes over the bag when looping.
    pub loops: u64,
    pub outcome: PlaybackOutcome,
}

#[derive(Debug)]
enum Command {
    Pause,
    Resume,
    TogglePause,
    Seek(i64),
    SetRate(f64),
    Burst(usize, oneshot::Sender<usize>),
}

/// Replays a bag through the transport.
pub struct Player {
    transport: Arc<dyn TransportPort>,
    storage: Arc<dyn StoragePort>,
    options: StorageOptions,
    config: PlayConfig,
    busy: Option<BusyGuard>,
}

impl Player {
    pub fn new(
        transport: Arc<dyn TransportPort>,
        storage: Arc<dyn StoragePort>,
        options: StorageOptions,
        config: PlayConfig,
    ) -> Self {
        Self {
            transport,
            storage,
            options,
            config,
            busy: None,
        }
    }

    /// Keep `guard` alive until the playback task ends.
    pub(crate) fn hold(mut self, guard: BusyGuard) -> Self {
        self.busy = Some(guard);
        self
    }

    /// Open the bag, advertise a publisher per selected channel and start the
    /// scheduling loop.
    ///
    /// The session stops when `stop` is cancelled or its handle is dropped.
    pub async fn start(self, stop: CancellationToken) -> Result<PlaybackSession, SatchelError> {
        self.config.validate()?;
        validate_storage(&self.options)?;
        let filter = self.config.filter.compile()?;

        let reader = self
            .storage
            .open_read(&self.options)
            .map_err(|e| e.with_context(format!("open bag '{}'", self.options.uri)))?;

        let mut publishers: HashMap<String, Box<dyn PublisherHandle>> = HashMap::new();
        for channel in reader.channels() {
            if !filter.matches(&channel.name) {
                tracing::debug!(channel = %channel.name, "channel filtered out");
                continue;
            }
            let target = channel.renamed(self.config.remapped(&channel.name));
            match self.transport.advertise(&target) {
                Ok(publisher) => {
                    tracing::info!(channel = %channel.name, published_as = %target.name, "advertised");
                    publishers.insert(channel.name.clone(), publisher);
                }
                Err(e) => {
                    tracing::warn!(channel = %channel.name, error = %e, "advertise failed, channel skipped");
                }
            }
        }
        tracing::info!(
            uri = %self.options.uri,
            channels = publishers.len(),
            rate = self.config.rate,
            "playback started"
        );

        let stop = stop.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let paused = Arc::new(AtomicBool::new(self.config.start_paused));
        let playback = PlaybackLoop {
            reader: Some(reader),
            in_flight: None,
            selected: Arc::new(publishers.keys().cloned().collect()),
            publishers,
            window: VecDeque::with_capacity(self.config.read_ahead),
            read_ahead: self.config.read_ahead,
            exhausted: false,
            failure: None,
            selected_seen: false,
            bag_start: None,
            clock: None,
            config: self.config,
            paused: paused.clone(),
            stats: Stats::default(),
        };
        let task = tokio::spawn(playback.run(rx, stop.clone(), self.busy));

        Ok(PlaybackSession {
            commands: tx,
            stop,
            paused,
            task,
        })
    }
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

/// Control handle of a running playback.
///
/// Controls sent after the session ended are ignored. Dropping the handle
/// stops the playback.
pub struct PlaybackSession {
    commands: mpsc::UnboundedSender<Command>,
    stop: CancellationToken,
    paused: Arc<AtomicBool>,
    task: JoinHandle<Result<PlaybackSummary, SatchelError>>,
}

impl PlaybackSession {
    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn toggle_pause(&self) {
        self.send(Command::TogglePause);
    }

    /// Continue from the first record stamped at or after `timestamp_ns`.
    pub fn seek(&self, timestamp_ns: i64) {
        self.send(Command::Seek(timestamp_ns));
    }

    pub fn set_rate(&self, rate: f64) -> Result<(), SatchelError> {
        validate_rate(rate)?;
        self.send(Command::SetRate(rate));
        Ok(())
    }

    /// Publish the next `n` records right away. Only acts while paused;
    /// returns how many records went out.
    pub async fn burst(&self, n: usize) -> Result<usize, SatchelError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Burst(n, reply))
            .map_err(|_| SatchelError::Task("playback session has ended".into()))?;
        rx.await
            .map_err(|_| SatchelError::Task("playback session has ended".into()))
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(mut self) -> Result<PlaybackSummary, SatchelError> {
        (&mut self.task).await?
    }

    pub async fn stop_and_wait(self) -> Result<PlaybackSummary, SatchelError> {
        self.stop();
        self.wait().await
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("playback already finished, control ignored");
        }
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

// ---------------------------------------------------------------------------
// Storage reads
// ---------------------------------------------------------------------------

/// What one blocking read does.
#[derive(Debug, Clone, Copy)]
struct ReadJob {
    /// Start over from the first record.
    rewind: bool,
    /// Discard records stamped before this, uncounted.
    skip_before: Option<i64>,
    /// Selected records to collect.
    want: usize,
}

impl ReadJob {
    fn next(want: usize) -> Self {
        Self {
            rewind: false,
            skip_before: None,
            want,
        }
    }
}

#[derive(Default)]
struct ReadBatch {
    records: Vec<MessageRecord>,
    /// Timestamp of the first record read, selected or not.
    first_ts: Option<i64>,
    skipped: u64,
    end: bool,
    failure: Option<StorageError>,
}

type ReadTask = JoinHandle<(Box<dyn BagReader>, ReadBatch)>;

fn read_batch(reader: &mut dyn BagReader, selected: &HashSet<String>, job: ReadJob) -> ReadBatch {
    let mut batch = ReadBatch::default();
    if job.rewind {
        if let Err(e) = reader.rewind() {
            batch.failure = Some(e);
            return batch;
        }
    }
    while batch.records.len() < job.want {
        match reader.next_record() {
            Ok(Some(record)) => {
                if job.skip_before.is_some_and(|target| record.timestamp_ns < target) {
                    continue;
                }
                batch.first_ts.get_or_insert(record.timestamp_ns);
                if selected.contains(&record.channel) {
                    batch.records.push(record);
                } else {
                    batch.skipped += 1;
                }
            }
            Ok(None) => {
                batch.end = true;
                break;
            }
            Err(e) => {
                batch.failure = Some(e);
                break;
            }
        }
    }
    batch
}

async fn read_done(in_flight: &mut Option<ReadTask>) -> Result<(Box<dyn BagReader>, ReadBatch), JoinError> {
    match in_flight {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Scheduling loop
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Stats {
    published: u64,
    skipped: u64,
    publish_failures: u64,
    loops: u64,
}

struct PlaybackLoop {
    /// `None` while a read is in flight.
    reader: Option<Box<dyn BagReader>>,
    in_flight: Option<ReadTask>,
    /// Recorded channel names that have a publisher.
    selected: Arc<HashSet<String>>,
    /// Keyed by recorded channel name.
    publishers: HashMap<String, Box<dyn PublisherHandle>>,
    /// Selected records read ahead of the playback position.
    window: VecDeque<MessageRecord>,
    read_ahead: usize,
    exhausted: bool,
    /// Read error, raised once the records read before it are published.
    failure: Option<StorageError>,
    /// Whether the bag holds any selected record at all.
    selected_seen: bool,
    /// Timestamp of the first record of the current pass, selected or not.
    bag_start: Option<i64>,
    clock: Option<PlaybackClock>,
    config: PlayConfig,
    paused: Arc<AtomicBool>,
    stats: Stats,
}

impl PlaybackLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        stop: CancellationToken,
        _busy: Option<BusyGuard>,
    ) -> Result<PlaybackSummary, SatchelError> {
        let result = self.schedule(&mut commands, &stop).await;
        let summary = PlaybackSummary {
            published: self.stats.published,
            skipped: self.stats.skipped,
            publish_failures: self.stats.publish_failures,
            loops: self.stats.loops,
            outcome: *result.as_ref().unwrap_or(&PlaybackOutcome::Stopped),
        };
        tracing::info!(
            published = summary.published,
            skipped = summary.skipped,
            publish_failures = summary.publish_failures,
            loops = summary.loops,
            outcome = %summary.outcome,
            "playback finished"
        );
        match result {
            Ok(_) => Ok(summary),
            Err(e) => {
                tracing::error!(error = %e, "playback aborted");
                Err(e)
            }
        }
    }

    async fn schedule(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        stop: &CancellationToken,
    ) -> Result<PlaybackOutcome, SatchelError> {
        self.spawn_read(ReadJob::next(self.read_ahead));
        if !self.config.delay().is_zero() {
            tokio::select! {
                _ = stop.cancelled() => return Ok(PlaybackOutcome::Stopped),
                _ = tokio::time::sleep(self.config.delay()) => {}
            }
        }
        self.finish_read().await?;

        let Some(start) = self.bag_start else {
            if let Some(e) = self.failure.take() {
                return Err(e.into());
            }
            tracing::info!("bag is empty");
            return Ok(PlaybackOutcome::Completed);
        };
        let mut clock = PlaybackClock::new(Instant::now(), start, self.config.rate);
        if self.config.start_paused {
            clock.pause(Instant::now());
        }
        self.clock = Some(clock);
        self.sync_paused();

        let mut commands_open = true;
        loop {
            if stop.is_cancelled() {
                return Ok(PlaybackOutcome::Stopped);
            }
            self.prefetch();

            if self.window.is_empty() && self.in_flight.is_none() {
                if let Some(e) = self.failure.take() {
                    return Err(e.into());
                }
                if !self.config.loop_playback || !self.selected_seen {
                    return Ok(PlaybackOutcome::Completed);
                }
                self.restart().await?;
                continue;
            }

            let deadline = match (&self.clock, self.window.front()) {
                (Some(clock), Some(next)) if !clock.is_paused() => Some(clock.deadline(next.timestamp_ns)),
                _ => None,
            };

            tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(PlaybackOutcome::Stopped),
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.apply(command).await?,
                    None => commands_open = false,
                },
                done = read_done(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    let (reader, batch) = done?;
                    self.absorb(reader, batch);
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    if let Some(record) = self.window.pop_front() {
                        self.publish(&record);
                    }
                }
            }
        }
    }

    /// Start a background read unless one is running, the bag is exhausted
    /// or the window is still more than half full.
    fn prefetch(&mut self) {
        if self.exhausted || self.window.len() > self.read_ahead / 2 {
            return;
        }
        let want = self.read_ahead - self.window.len();
        self.spawn_read(ReadJob::next(want));
    }

    fn spawn_read(&mut self, job: ReadJob) {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        let selected = self.selected.clone();
        self.in_flight = Some(tokio::task::spawn_blocking(move || {
            let batch = read_batch(reader.as_mut(), &selected, job);
            (reader, batch)
        }));
    }

    /// Wait for the running read, if any, and take in its records.
    async fn finish_read(&mut self) -> Result<(), SatchelError> {
        if let Some(task) = self.in_flight.take() {
            let (reader, batch) = task.await?;
            self.absorb(reader, batch);
        }
        Ok(())
    }

    /// Run `job` now and take in its records.
    async fn read_now(&mut self, job: ReadJob) -> Result<(), SatchelError> {
        self.finish_read().await?;
        self.spawn_read(job);
        self.finish_read().await
    }

    fn absorb(&mut self, reader: Box<dyn BagReader>, batch: ReadBatch) {
        self.reader = Some(reader);
        self.stats.skipped += batch.skipped;
        if let Some(ts) = batch.first_ts {
            self.bag_start.get_or_insert(ts);
        }
        if !batch.records.is_empty() {
            self.selected_seen = true;
        }
        self.window.extend(batch.records);
        if batch.end {
            self.exhausted = true;
        }
        if let Some(e) = batch.failure {
            self.exhausted = true;
            self.failure = Some(e);
        }
    }

    /// Rewind for another pass and re-anchor the clock at the bag start.
    async fn restart(&mut self) -> Result<(), SatchelError> {
        self.stats.loops += 1;
        self.exhausted = false;
        self.bag_start = None;
        self.read_now(ReadJob {
            rewind: true,
            ..ReadJob::next(self.read_ahead)
        })
        .await?;
        let now = Instant::now();
        if let (Some(clock), Some(start)) = (self.clock.as_mut(), self.bag_start) {
            clock.jump(start, now);
        }
        tracing::debug!(loops = self.stats.loops, "playback looped");
        Ok(())
    }

    async fn apply(&mut self, command: Command) -> Result<(), SatchelError> {
        let now = Instant::now();
        match command {
            Command::Pause => self.with_clock(|clock| clock.pause(now)),
            Command::Resume => self.with_clock(|clock| clock.resume(now)),
            Command::TogglePause => self.with_clock(|clock| {
                if clock.is_paused() {
                    clock.resume(now)
                } else {
                    clock.pause(now)
                }
            }),
            Command::SetRate(rate) => {
                self.with_clock(|clock| clock.set_rate(rate, now));
                self.config.rate = rate;
                tracing::info!(rate, "playback rate changed");
            }
            Command::Seek(target) => self.seek(target).await?,
            Command::Burst(n, reply) => {
                let sent = self.burst(n).await?;
                let _ = reply.send(sent);
            }
        }
        self.sync_paused();
        Ok(())
    }

    fn with_clock(&mut self, f: impl FnOnce(&mut PlaybackClock)) {
        if let Some(clock) = self.clock.as_mut() {
            f(clock);
        }
    }

    fn sync_paused(&self) {
        let paused = self.clock.as_ref().is_some_and(PlaybackClock::is_paused);
        self.paused.store(paused, Ordering::Release);
    }

    /// Reposition to the first record stamped at or after `target`, which
    /// becomes due now. Seeking past the end finishes the pass.
    async fn seek(&mut self, target: i64) -> Result<(), SatchelError> {
        self.finish_read().await?;
        self.window.clear();
        self.exhausted = false;
        self.failure = None;
        self.read_now(ReadJob {
            rewind: true,
            skip_before: Some(target),
            want: self.read_ahead,
        })
        .await?;
        let now = Instant::now();
        self.with_clock(|clock| clock.jump(target, now));
        tracing::info!(target_ns = target, "playback seek");
        Ok(())
    }

    async fn burst(&mut self, n: usize) -> Result<usize, SatchelError> {
        if !self.clock.as_ref().is_some_and(PlaybackClock::is_paused) {
            tracing::warn!("burst ignored, playback is not paused");
            return Ok(0);
        }
        let mut sent = 0;
        let mut last_ts = None;
        while sent < n {
            if self.window.is_empty() {
                self.finish_read().await?;
            }
            if self.window.is_empty() && !self.exhausted {
                self.read_now(ReadJob::next(self.read_ahead)).await?;
            }
            let Some(record) = self.window.pop_front() else {
                break;
            };
            last_ts = Some(record.timestamp_ns);
            self.publish(&record);
            sent += 1;
        }
        if let Some(ts) = last_ts {
            let now = Instant::now();
            self.with_clock(|clock| clock.jump(ts, now));
        }
        tracing::debug!(requested = n, sent, "burst");
        Ok(sent)
    }

    fn publish(&mut self, record: &MessageRecord) {
        let Some(publisher) = self.publishers.get(&record.channel) else {
            return;
        };
        let outgoing = if publisher.channel() == record.channel {
            record.clone()
        } else {
            MessageRecord {
                channel: publisher.channel().to_string(),
                ..record.clone()
            }
        };
        match publisher.publish(&outgoing) {
            Ok(()) => self.stats.published += 1,
            Err(e) => {
                self.stats.publish_failures += 1;
                tracing::warn!(
                    channel = %record.channel,
                    timestamp_ns = record.timestamp_ns,
                    error = %e,
                    "publish failed, continuing"
                );
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
