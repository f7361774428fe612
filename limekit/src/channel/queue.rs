//! Bounded envelope queues with depth accounting.
//!
//! The intake buffer and the per-type ready queues share this primitive:
//! a bounded (or, with capacity zero, unbounded) channel whose current
//! depth can be read for diagnostics. A full bounded queue parks the
//! producer, which is what propagates backpressure from a stalled
//! consumer all the way to the transport reader.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// The receiving half of the queue was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue closed")]
pub(crate) struct QueueClosed;

/// Creates a queue; a capacity of zero means unbounded.
pub(crate) fn envelope_queue<T>(capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let depth = Arc::new(AtomicUsize::new(0));

    if capacity == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            QueueSender {
                inner: SenderInner::Unbounded(tx),
                depth: Arc::clone(&depth),
            },
            QueueReceiver {
                inner: ReceiverInner::Unbounded(rx),
                depth,
            },
        )
    } else {
        let (tx, rx) = mpsc::channel(capacity);
        (
            QueueSender {
                inner: SenderInner::Bounded(tx),
                depth: Arc::clone(&depth),
            },
            QueueReceiver {
                inner: ReceiverInner::Bounded(rx),
                depth,
            },
        )
    }
}

enum SenderInner<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for SenderInner<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Bounded(tx) => Self::Bounded(tx.clone()),
            Self::Unbounded(tx) => Self::Unbounded(tx.clone()),
        }
    }
}

/// Producing half; cloneable.
pub(crate) struct QueueSender<T> {
    inner: SenderInner<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueues an item, parking until capacity is available.
    pub(crate) async fn send(&self, item: T) -> Result<(), QueueClosed> {
        match &self.inner {
            SenderInner::Bounded(tx) => tx.send(item).await.map_err(|_| QueueClosed)?,
            SenderInner::Unbounded(tx) => tx.send(item).map_err(|_| QueueClosed)?,
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Returns the number of items currently queued.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

enum ReceiverInner<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// Consuming half; single owner.
pub(crate) struct QueueReceiver<T> {
    inner: ReceiverInner<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Dequeues the next item; `None` when all senders are gone and the
    /// queue is drained.
    pub(crate) async fn recv(&mut self) -> Option<T> {
        let item = match &mut self.inner {
            ReceiverInner::Bounded(rx) => rx.recv().await,
            ReceiverInner::Unbounded(rx) => rx.recv().await,
        };
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        item
    }

    /// Returns the number of items currently queued.
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_fifo_and_depth() {
        let (tx, mut rx) = envelope_queue::<u32>(8);

        for i in 0..3 {
            tx.send(i).await.unwrap();
        }
        assert_eq!(tx.depth(), 3);

        for i in 0..3 {
            assert_eq!(rx.recv().await, Some(i));
        }
        assert_eq!(rx.depth(), 0);
    }

    #[tokio::test]
    async fn test_bounded_send_parks_when_full() {
        let (tx, mut rx) = envelope_queue::<u32>(1);
        tx.send(1).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.send(2)).await;
        assert!(blocked.is_err(), "send should park on a full queue");

        assert_eq!(rx.recv().await, Some(1));
        tx.send(2).await.unwrap();
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_zero_capacity_is_unbounded() {
        let (tx, mut rx) = envelope_queue::<u32>(0);
        for i in 0..1000 {
            tx.send(i).await.unwrap();
        }
        assert_eq!(tx.depth(), 1000);
        assert_eq!(rx.recv().await, Some(0));
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_senders_drop() {
        let (tx, mut rx) = envelope_queue::<u32>(4);
        tx.send(7).await.unwrap();
        drop(tx);

        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_drop() {
        let (tx, rx) = envelope_queue::<u32>(4);
        drop(rx);
        assert_eq!(tx.send(1).await, Err(QueueClosed));
    }
}
