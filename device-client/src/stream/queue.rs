use common::{FramePayload, RelayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Upper bound on queued frames.
pub const MAX_QUEUE_CAPACITY: usize = 4096;

#[derive(Debug)]
pub enum QueueItem {
    Frame(FramePayload),
    EndOfStream,
}

/// 帧队列
///
/// Bounded FIFO between the producer side and the relay pump. `put` waits
/// while the queue is full. `EndOfStream` is consumed by exactly one `get`.
#[derive(Clone)]
pub struct FrameQueue {
    tx: mpsc::Sender<QueueItem>,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_QUEUE_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            capacity,
        }
    }

    pub async fn put(&self, frame: FramePayload) -> Result<()> {
        self.tx
            .send(QueueItem::Frame(frame))
            .await
            .map_err(|_| RelayError::ProtocolError("frame queue closed".to_string()))
    }

    /// Enqueues the end-of-stream marker, waiting at most `timeout` for room.
    /// Returns whether the marker made it into the queue.
    pub async fn end_stream(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.tx.send(QueueItem::EndOfStream)).await,
            Ok(Ok(()))
        )
    }

    /// Next frame, or `None` once the end-of-stream marker is reached.
    pub async fn get(&self) -> Option<FramePayload> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(QueueItem::Frame(frame)) => Some(frame),
            Some(QueueItem::EndOfStream) | None => None,
        }
    }

    /// Discards whatever is queued. Returns how many items were dropped.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u32) -> FramePayload {
        FramePayload {
            image: format!("data:image/jpeg;base64,{}", n),
            detections: "{}".to_string(),
            width: n,
            height: n,
        }
    }

    #[test]
    fn test_capacity_is_clamped() {
        assert_eq!(FrameQueue::new(0).capacity(), 1);
        assert_eq!(FrameQueue::new(usize::MAX).capacity(), MAX_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_fifo_then_end_of_stream() {
        let queue = FrameQueue::new(4);
        queue.put(frame(1)).await.unwrap();
        queue.put(frame(2)).await.unwrap();
        assert!(queue.end_stream(Duration::from_millis(100)).await);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.get().await.unwrap().width, 1);
        assert_eq!(queue.get().await.unwrap().width, 2);
        assert!(queue.get().await.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_put_blocks_when_full() {
        let queue = FrameQueue::new(1);
        queue.put(frame(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.put(frame(2))).await;
        assert!(blocked.is_err());

        assert_eq!(queue.get().await.unwrap().width, 1);
        queue.put(frame(3)).await.unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_end_stream_unblocks_pending_get() {
        let queue = FrameQueue::new(2);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.end_stream(Duration::from_millis(100)).await);

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer should wake up")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_end_stream_gives_up_when_full() {
        let queue = FrameQueue::new(1);
        queue.put(frame(1)).await.unwrap();
        assert!(!queue.end_stream(Duration::from_millis(20)).await);

        assert_eq!(queue.drain().await, 1);
        assert!(queue.is_empty());
    }
}
