//! Pipeline notifications broadcast to observers.

use tokio::sync::broadcast;
use uuid::Uuid;

use docket_core::{defaults, ErrorKind, Priority, Stage, StageOutput};

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted {
        document_id: Uuid,
        stage: Stage,
        attempt: u32,
    },
    StageCompleted {
        document_id: Uuid,
        batch_id: Option<Uuid>,
        output: StageOutput,
    },
    StageFailed {
        document_id: Uuid,
        batch_id: Option<Uuid>,
        stage: Stage,
        kind: ErrorKind,
        error: String,
    },
    /// Finalization succeeded.
    DocumentCompleted {
        document_id: Uuid,
        batch_id: Option<Uuid>,
    },
    /// The document reached `failed`.
    DocumentFailed {
        document_id: Uuid,
        batch_id: Option<Uuid>,
        stage: Stage,
        error: String,
    },
    WorkerStarted { tier: Priority },
    WorkerStopped { tier: Priority },
}

impl PipelineEvent {
    /// Document-level terminal notification carrying a batch id.
    pub fn terminal_batch(&self) -> Option<Uuid> {
        match self {
            PipelineEvent::DocumentCompleted { batch_id, .. }
            | PipelineEvent::DocumentFailed { batch_id, .. } => *batch_id,
            _ => None,
        }
    }
}

/// Cloneable sender side of the event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(defaults::EVENT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish. Having no subscribers is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(PipelineEvent::WorkerStarted { tier: Priority::High });

        let mut rx = bus.subscribe();
        let doc = Uuid::new_v4();
        let batch = Uuid::new_v4();
        bus.emit(PipelineEvent::DocumentCompleted {
            document_id: doc,
            batch_id: Some(batch),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.terminal_batch(), Some(batch));
    }
}
