use super::handlers::AppState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use common::FramePayload;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, warn};

/// 帧推送端点
///
/// `GET /api/stream/frames`: every relayed frame as a `frame` event carrying
/// the frame JSON. A subscriber that falls behind gets a `warning` event and
/// continues from the newest frames.
pub async fn stream_frames(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.frame_hub.subscribe();
    debug!(
        "SSE client subscribed ({} subscriber(s))",
        state.frame_hub.subscriber_count()
    );

    Sse::new(frame_events(receiver)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn frame_events(
    receiver: broadcast::Receiver<Arc<FramePayload>>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(receiver).filter_map(|result| async move {
        match result {
            Ok(frame) => match serde_json::to_string(frame.as_ref()) {
                Ok(json) => Some(Ok(Event::default().event("frame").data(json))),
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("SSE client lagged, skipped {} frames", skipped);
                let event = Event::default()
                    .event("warning")
                    .data(format!("Lagged: skipped {} frames", skipped));
                Some(Ok(event))
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::FrameHub;

    fn frame(width: u32) -> FramePayload {
        FramePayload {
            image: "data:image/jpeg;base64,AA==".to_string(),
            detections: "{}".to_string(),
            width,
            height: 240,
        }
    }

    #[tokio::test]
    async fn test_frames_become_events() {
        let hub = FrameHub::new(4);
        let events = frame_events(hub.subscribe());
        tokio::pin!(events);

        hub.publish(frame(320));
        let event = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_warning_then_frames() {
        let hub = FrameHub::new(1);
        let events = frame_events(hub.subscribe());
        tokio::pin!(events);

        for width in 0..3 {
            hub.publish(frame(width));
        }

        // one warning for the skipped frames, then the newest frame
        let mut received = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), events.next()).await
        {
            assert!(event.is_ok());
            received += 1;
        }
        assert_eq!(received, 2);
    }
}
