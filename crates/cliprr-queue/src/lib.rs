//! Coordination-store plumbing: the queue broker, the progress bus, and the
//! shared decode semaphore.

pub mod error;
pub mod job;
pub mod progress;
pub mod queue;
pub mod semaphore;

pub use error::{QueueError, QueueResult};
pub use job::{CleanupJob, CleanupOp, DetectionJob, EpisodeJob, QueuedJob, TrimJob};
pub use progress::{ProgressBus, BROADCAST_CHANNEL, PENDING_BUFFER_CAPACITY};
pub use queue::{BrokerRecord, JobState, QueueBroker, QueueSnapshot};
pub use semaphore::{DecodePermit, DecodeSemaphore};
