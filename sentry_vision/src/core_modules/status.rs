// THEORY:
// `StatusSnapshot` is the only piece of detector state that other tasks read.
// The worker publishes it through a tokio `watch` channel, replacing the whole
// value on each change, so a reader can never pair `motion = true` with a stale
// `last_motion`. Readers either take the current value or wait for the next
// change. Older values are overwritten and never replayed.

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use tokio::sync::watch;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What the dashboard shows: is motion active, and when did it last start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub motion: bool,
    #[serde(serialize_with = "serialize_timestamp")]
    pub last_motion: Option<DateTime<Local>>,
}

fn serialize_timestamp<S>(value: &Option<DateTime<Local>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(at) => serializer.collect_str(&at.format(TIMESTAMP_FORMAT)),
        None => serializer.serialize_none(),
    }
}

/// Write side, held by the detector.
#[derive(Clone)]
pub struct StatusPublisher {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(StatusSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> StatusHandle {
        StatusHandle {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> StatusSnapshot {
        *self.tx.borrow()
    }

    pub fn motion_started(&self, at: DateTime<Local>) {
        self.publish(StatusSnapshot {
            motion: true,
            last_motion: Some(at),
        });
    }

    pub fn motion_ended(&self) {
        self.tx.send_modify(|status| status.motion = false);
    }

    /// Replaces the published value, with or without subscribers.
    pub fn publish(&self, snapshot: StatusSnapshot) {
        self.tx.send_replace(snapshot);
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side, handed to the web layer.
#[derive(Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusHandle {
    pub fn current(&self) -> StatusSnapshot {
        *self.rx.borrow()
    }

    /// Waits for the next published change. `None` once every publisher is gone.
    pub async fn changed(&mut self) -> Option<StatusSnapshot> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
