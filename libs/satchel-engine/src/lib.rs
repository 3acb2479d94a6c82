pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod orchestrator;
pub mod player;
pub mod queue;
pub mod recorder;

pub use clock::PlaybackClock;
pub use config::{PlayConfig, RecordConfig, SatchelConfig, validate_storage};
pub use discovery::{DiscoveryReport, TopicDiscovery};
pub use error::SatchelError;
pub use filter::{ChannelFilter, TopicFilter};
pub use orchestrator::{Operation, Orchestrator};
pub use player::{PlaybackOutcome, PlaybackSession, PlaybackSummary, Player};
pub use queue::{EnqueueError, QueueConsumer, QueueItem, QueueProducer, record_queue};
pub use recorder::{RecordSummary, Recorder, RecordingSession};
