pub mod batch;
pub mod heartbeat;
pub mod queue;
pub mod sender;

pub use batch::{Batch, Confirmation, FlushPolicy};
pub use heartbeat::{Heartbeat, HeartbeatError};
pub use queue::{bounded, QueueConsumer, QueueError, QueueProducer, QueuedMessage};
pub use sender::{Sender, SenderError};
