//! Hand-off from synchronous capture/inference loops to asynchronous sinks

pub mod bridge;
pub mod preview;
pub mod queue;
pub mod work;

pub use bridge::{Bridge, BridgeStats, ChannelStats};
pub use preview::{PreviewFeed, PreviewReceiver};
pub use queue::{Backpressure, BoundedQueue, PushOutcome, QueueStats};
pub use work::{Broadcaster, Notification, ResultRecord, ResultStore, WorkItem};
