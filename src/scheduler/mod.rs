pub mod cancel;
pub mod job;
pub mod queue;
pub mod slots;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use cancel::{CancelAck, CancellationController};
pub use job::{JobState, MigrationJob};
pub use queue::MigrationQueue;

/// The queue, job table and slot pool behind the one lock that admission
/// and cancellation share.
pub type SharedQueue = Arc<Mutex<MigrationQueue>>;
