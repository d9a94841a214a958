use common::FramePayload;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// 帧分发
///
/// Frames relayed from devices fan out to every HTTP subscriber. A subscriber
/// that falls more than `capacity` frames behind skips ahead instead of
/// holding the device back.
#[derive(Clone)]
pub struct FrameHub {
    sender: broadcast::Sender<Arc<FramePayload>>,
}

impl FrameHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers the frame reached.
    pub fn publish(&self, frame: FramePayload) -> usize {
        match self.sender.send(Arc::new(frame)) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("Dropping frame, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FramePayload>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn frame(n: u32) -> FramePayload {
        FramePayload {
            image: format!("data:image/jpeg;base64,{}", n),
            detections: "{}".to_string(),
            width: n,
            height: n,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = FrameHub::new(8);
        assert_eq!(hub.publish(frame(1)), 0);

        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);
        assert_eq!(hub.publish(frame(2)), 2);

        assert_eq!(first.recv().await.unwrap().width, 2);
        assert_eq!(second.recv().await.unwrap().width, 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_skips_ahead() {
        let hub = FrameHub::new(2);
        let mut rx = hub.subscribe();
        for n in 0..5 {
            hub.publish(frame(n));
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().width, 3);
        assert_eq!(rx.recv().await.unwrap().width, 4);
    }
}
