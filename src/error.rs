//! Error types shared across capture, streaming and the bridge

use std::fmt;

use thiserror::Error;

/// A single backend failing to open a device
#[derive(Debug, Error)]
pub enum OpenError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("backend `{0}` is not available in this build")]
    Unavailable(String),

    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(String),
}

/// One entry of the backend fallback chain that was tried during a start
#[derive(Debug, Clone)]
pub struct BackendAttempt {
    pub backend: String,
    pub reason: String,
}

/// Every backend in the preference order failed to open the device
#[derive(Debug, Clone, Error)]
pub struct StartError {
    pub device: String,
    pub attempts: Vec<BackendAttempt>,
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "failed to open {}: no backends configured", self.device);
        }
        write!(f, "failed to open {} (tried ", self.device)?;
        for (i, attempt) in self.attempts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", attempt.backend, attempt.reason)?;
        }
        write!(f, ")")
    }
}

/// A single failed frame read. Recovered inside the capture loop.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("timed out waiting for a frame")]
    Timeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(String),
}

/// A consumer callback failed; the consumer is pruned
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer closed")]
    Closed,

    #[error("consumer failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("consumer `{consumer}` is already attached to stream `{stream}`")]
    DuplicateConsumer { stream: String, consumer: String },

    #[error(transparent)]
    Start(#[from] StartError),
}

/// Downstream persistence or push call failed
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("item rejected: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge already started")]
    AlreadyStarted,

    #[error("bridge was stopped and cannot be restarted")]
    Stopped,

    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
