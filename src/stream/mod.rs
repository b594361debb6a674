//! Device streams: sources, their consumers and the manager that owns them

pub mod consumer;
pub mod manager;
pub mod source;

pub use consumer::{CallbackConsumer, ConsumerRegistry, FrameConsumer};
pub use manager::StreamManager;
pub use source::{FrameSource, FrameSourceStats, SourceStatus};
