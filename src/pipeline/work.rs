//! Work items crossing the bridge and the async sinks that consume them
//!
//! Only derived results travel through the bridge, never pixel buffers.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SinkError;

/// A result to durably store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    /// Logical task or session the result belongs to
    pub session_id: String,
    pub source_id: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub payload: serde_json::Value,
}

/// A result to fan out to live subscribers of `session_id`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub session_id: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Persist(ResultRecord),
    Push(Notification),
}

impl WorkItem {
    pub fn session_id(&self) -> &str {
        match self {
            WorkItem::Persist(record) => &record.session_id,
            WorkItem::Push(notification) => &notification.session_id,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            WorkItem::Persist(record) => record.sequence,
            WorkItem::Push(notification) => notification.sequence,
        }
    }
}

impl From<ResultRecord> for WorkItem {
    fn from(record: ResultRecord) -> Self {
        WorkItem::Persist(record)
    }
}

impl From<Notification> for WorkItem {
    fn from(notification: Notification) -> Self {
        WorkItem::Push(notification)
    }
}

/// Persistent store for results.
///
/// An instance is owned by exactly one bridge worker and only ever polled on
/// that worker's runtime, so connections and sessions created in `connect`
/// never cross into another async context.
#[async_trait]
pub trait ResultStore: Send {
    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn store(&mut self, record: ResultRecord) -> Result<(), SinkError>;

    async fn close(&mut self) {}
}

/// Push channel to live subscribers. Unknown or disconnected subscribers are
/// the implementation's concern.
#[async_trait]
pub trait Broadcaster: Send {
    async fn connect(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn broadcast(
        &mut self,
        session_id: &str,
        notification: Notification,
    ) -> Result<(), SinkError>;

    async fn close(&mut self) {}
}

pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
