//! One-way event bus. The queue, watcher and edit bridge publish here;
//! subscribers replace their view with each snapshot rather than applying
//! deltas, so a lagging receiver is made whole by the next event.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{TaskStatus, TransferTask};

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOutcome {
    Uploaded,
    Error,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// Full queue snapshot in enqueue order.
    QueueUpdated { tasks: Vec<TransferTask> },
    /// A task reached a terminal status.
    TaskFinished {
        id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// External-edit re-upload outcome for a watched file.
    EditStatus {
        remote_path: String,
        status: EditOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The directory watcher enqueued an upload.
    WatcherUpload { root: String, remote_path: String },
}

#[derive(Clone)]
pub struct EngineEvents {
    tx: broadcast::Sender<EngineEvent>,
}

impl EngineEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; an event with no subscribers is dropped.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EngineEvents {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let events = EngineEvents::new();
        let mut rx = events.subscribe();

        events.emit(EngineEvent::QueueUpdated { tasks: Vec::new() });
        events.emit(EngineEvent::TaskFinished {
            id: "t1".to_string(),
            status: TaskStatus::Completed,
            error: None,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::QueueUpdated { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            EngineEvent::TaskFinished { .. }
        ));
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let events = EngineEvents::new();
        events.emit(EngineEvent::QueueUpdated { tasks: Vec::new() });
    }
}
