use super::queue::FrameQueue;
use async_trait::async_trait;
use common::{FramePayload, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outbound side of the relay pump. `forward` returns once the frame has been
/// handed to the transport, which is where outbound backpressure applies.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn forward(&self, frame: FramePayload) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded: u64,
    pub failed: u64,
}

/// 转发泵：从帧队列取帧并逐个发送
pub struct RelayPump {
    queue: FrameQueue,
    sink: Arc<dyn FrameSink>,
}

impl RelayPump {
    pub fn new(queue: FrameQueue, sink: Arc<dyn FrameSink>) -> Self {
        Self { queue, sink }
    }

    /// Runs until the end-of-stream marker is dequeued. A frame that cannot be
    /// sent is dropped; the pump keeps draining so the producer never stalls on
    /// a dead session.
    pub async fn run(self) -> RelayStats {
        let mut stats = RelayStats::default();
        info!("📡 Relay pump started");

        while let Some(frame) = self.queue.get().await {
            match self.sink.forward(frame).await {
                Ok(()) => {
                    stats.forwarded += 1;
                    debug!("Frame #{} forwarded", stats.forwarded);
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!("⚠️  Failed to forward frame: {}", e);
                }
            }
        }

        info!(
            "⏹️  Relay pump finished ({} forwarded, {} dropped)",
            stats.forwarded, stats.failed
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::RelayError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<FramePayload>>,
        fail_every: u64,
        calls: AtomicU64,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn forward(&self, frame: FramePayload) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && n % self.fail_every == 0 {
                return Err(RelayError::ConnectionError("session dropped".to_string()));
            }
            self.frames.lock().await.push(frame);
            Ok(())
        }
    }

    fn frame(n: u32) -> FramePayload {
        FramePayload {
            image: "data:image/jpeg;base64,".to_string(),
            detections: "[]".to_string(),
            width: n,
            height: 1,
        }
    }

    #[tokio::test]
    async fn test_forwards_in_order_and_stops_at_end_of_stream() {
        let queue = FrameQueue::new(8);
        let sink = Arc::new(RecordingSink::default());

        for n in 0..3 {
            queue.put(frame(n)).await.unwrap();
        }
        assert!(queue.end_stream(Duration::from_millis(100)).await);
        // anything after the marker belongs to a later stream
        queue.put(frame(99)).await.unwrap();

        let stats = RelayPump::new(queue.clone(), sink.clone()).run().await;
        assert_eq!(stats, RelayStats { forwarded: 3, failed: 0 });

        let widths: Vec<u32> = sink.frames.lock().await.iter().map(|f| f.width).collect();
        assert_eq!(widths, vec![0, 1, 2]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_send_failures_do_not_stop_the_pump() {
        let queue = FrameQueue::new(8);
        let sink = Arc::new(RecordingSink {
            fail_every: 2,
            ..Default::default()
        });

        for n in 0..4 {
            queue.put(frame(n)).await.unwrap();
        }
        assert!(queue.end_stream(Duration::from_millis(100)).await);

        let stats = RelayPump::new(queue, sink).run().await;
        assert_eq!(stats, RelayStats { forwarded: 2, failed: 2 });
    }

    #[tokio::test]
    async fn test_idle_pump_exits_on_end_of_stream() {
        let queue = FrameQueue::new(2);
        let sink = Arc::new(RecordingSink::default());
        let pump = tokio::spawn(RelayPump::new(queue.clone(), sink.clone()).run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.end_stream(Duration::from_millis(100)).await);

        let stats = tokio::time::timeout(Duration::from_secs(1), pump)
            .await
            .expect("pump should exit")
            .unwrap();
        assert_eq!(stats.forwarded, 0);
        assert!(sink.frames.lock().await.is_empty());
    }
}
