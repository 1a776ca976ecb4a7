// THEORY:
// The `FrameBus` carries display-ready frames from the detector worker to any
// number of viewers. It is a tokio `broadcast` channel: slow viewers lag and
// skip frames instead of holding up detection, and the worker only renders and
// encodes when at least one viewer is subscribed.
//
// The bus also carries a "closed" flag. The worker raises it on exit so every
// `frame_stream` ends, even while other clones of the bus are still alive.

use futures::Stream;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
}

impl FrameFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            FrameFormat::Jpeg => "image/jpeg",
        }
    }
}

/// One encoded display frame: the annotated image and the mask side by side.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub ts_millis: u64,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub data: Arc<[u8]>,
}

#[derive(Clone)]
pub struct FrameBus {
    frames_tx: broadcast::Sender<FramePacket>,
    closed_tx: Arc<watch::Sender<bool>>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (closed_tx, _) = watch::channel(false);
        Self {
            frames_tx,
            closed_tx: Arc::new(closed_tx),
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.frames_tx.receiver_count() > 0
    }

    /// Returns how many viewers received the packet.
    pub fn publish(&self, packet: FramePacket) -> usize {
        self.frames_tx.send(packet).unwrap_or(0)
    }

    /// Ends every stream. Frames already queued are still delivered.
    pub fn close(&self) {
        self.closed_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

/// Subscribes immediately and yields packets until the bus closes. The stream
/// owns its receivers and does not borrow `bus`.
pub fn frame_stream(bus: &FrameBus) -> impl Stream<Item = FramePacket> + Send + 'static + use<> {
    let frames = bus.frames_tx.subscribe();
    let closed = bus.closed_tx.subscribe();

    futures::stream::unfold((frames, closed), |(mut frames, mut closed)| async move {
        loop {
            tokio::select! {
                biased;
                received = frames.recv() => match received {
                    Ok(packet) => return Some((packet, (frames, closed))),
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "viewer lagged, skipping frames");
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = async {
                    let _ = closed.wait_for(|closed| *closed).await;
                } => return None,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn packet(ts_millis: u64) -> FramePacket {
        FramePacket {
            ts_millis,
            width: 2,
            height: 1,
            format: FrameFormat::Jpeg,
            data: Arc::from(vec![0xFF, 0xD8].into_boxed_slice()),
        }
    }

    #[tokio::test]
    async fn stream_delivers_until_closed() {
        let bus = FrameBus::new(4);
        assert!(!bus.has_subscribers());
        let mut stream = Box::pin(frame_stream(&bus));
        assert!(bus.has_subscribers());

        assert_eq!(bus.publish(packet(1)), 1);
        assert_eq!(bus.publish(packet(2)), 1);
        bus.close();

        assert_eq!(stream.next().await.map(|p| p.ts_millis), Some(1));
        assert_eq!(stream.next().await.map(|p| p.ts_millis), Some(2));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn lagging_viewer_skips_to_recent_frames() {
        let bus = FrameBus::new(2);
        let stream = frame_stream(&bus);
        for ts in 0..10 {
            bus.publish(packet(ts));
        }
        bus.close();

        let seen: Vec<u64> = stream.map(|p| p.ts_millis).collect().await;
        assert_eq!(seen, vec![8, 9]);
    }

    #[test]
    fn publish_without_viewers_is_harmless() {
        let bus = FrameBus::new(1);
        assert_eq!(bus.publish(packet(0)), 0);
        assert_eq!(FrameFormat::Jpeg.mime_type(), "image/jpeg");
    }

    #[tokio::test]
    async fn stream_outlives_the_bus_handle_it_came_from() {
        let bus = FrameBus::new(4);
        let publisher = bus.clone();
        let mut stream = Box::pin(frame_stream(&bus));
        drop(bus);

        publisher.publish(packet(7));
        publisher.close();
        assert_eq!(stream.next().await.map(|p| p.ts_millis), Some(7));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribing_after_close_ends_immediately() {
        let bus = FrameBus::new(1);
        bus.close();
        assert!(bus.is_closed());
        let mut stream = Box::pin(frame_stream(&bus));
        assert!(stream.next().await.is_none());
    }
}
