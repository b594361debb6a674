//! Live preview feed
//!
//! A consumer that keeps only the freshest frames for a streaming response.
//! Unlike the bridge channels it evicts the oldest queued frame when full:
//! a stale preview frame is worthless once a newer one exists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::queue::{Backpressure, BoundedQueue, PushOutcome, QueueStats};
use crate::capture::Frame;
use crate::error::ConsumerError;
use crate::stream::FrameConsumer;

pub struct PreviewFeed {
    id: String,
    queue: Arc<BoundedQueue<Frame>>,
    open: Arc<AtomicBool>,
}

/// Reading half handed to the streaming response. Dropping it deactivates
/// the feed, which is then pruned from its source on the next frame.
pub struct PreviewReceiver {
    queue: Arc<BoundedQueue<Frame>>,
    open: Arc<AtomicBool>,
}

impl PreviewFeed {
    pub fn new(id: impl Into<String>, capacity: usize) -> (Arc<Self>, PreviewReceiver) {
        let id = id.into();
        let queue = Arc::new(BoundedQueue::new(
            format!("preview:{}", id),
            capacity,
            Backpressure::DropOldest,
        ));
        let open = Arc::new(AtomicBool::new(true));

        let feed = Arc::new(Self {
            id,
            queue: Arc::clone(&queue),
            open: Arc::clone(&open),
        });
        (feed, PreviewReceiver { queue, open })
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

impl FrameConsumer for PreviewFeed {
    fn id(&self) -> &str {
        &self.id
    }

    fn on_frame(&self, frame: &Frame) -> Result<(), ConsumerError> {
        match self.queue.push(frame.clone()) {
            PushOutcome::Closed => Err(ConsumerError::Closed),
            _ => Ok(()),
        }
    }

    fn is_active(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl PreviewReceiver {
    pub fn try_recv(&self) -> Option<Frame> {
        self.queue.try_pop()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.queue.pop_timeout(timeout)
    }

    /// Await the next preview frame. Pair with a timeout in the caller: a
    /// feed whose stream stopped simply stops producing.
    pub async fn recv(&self) -> Option<Frame> {
        self.queue.pop_async().await
    }
}

impl Drop for PreviewReceiver {
    fn drop(&mut self) {
        self.open.store(false, Ordering::Release);
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::capture::{PixelFormat, RawFrame};

    fn frame(sequence: u64) -> Frame {
        let raw = RawFrame {
            data: Bytes::from_static(&[1, 2, 3]),
            width: 1,
            height: 1,
            format: PixelFormat::Rgb24,
            device_timestamp: None,
        };
        Frame::stamp(raw, Arc::from("cam"), sequence)
    }

    #[test]
    fn keeps_only_the_freshest_frames() {
        let (feed, rx) = PreviewFeed::new("preview-1", 2);
        for seq in 0..5 {
            feed.on_frame(&frame(seq)).unwrap();
        }

        assert_eq!(rx.try_recv().map(|f| f.sequence()), Some(3));
        assert_eq!(rx.try_recv().map(|f| f.sequence()), Some(4));
        assert!(rx.try_recv().is_none());
        assert_eq!(feed.stats().replaced, 3);
    }

    #[test]
    fn dropping_the_receiver_deactivates_the_feed() {
        let (feed, rx) = PreviewFeed::new("preview-2", 2);
        assert!(feed.is_active());
        drop(rx);

        assert!(!feed.is_active());
        assert!(matches!(feed.on_frame(&frame(0)), Err(ConsumerError::Closed)));
    }
}
