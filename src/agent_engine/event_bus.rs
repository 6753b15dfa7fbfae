use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::agent_engine::state::RunSnapshot;
use crate::errors::RunError;

/// Progress notifications for one run, delivered in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    /// Status change and/or newly appended turns.
    Data(RunSnapshot),
    Error(RunSnapshot, RunError),
}

impl RunEvent {
    pub fn snapshot(&self) -> &RunSnapshot {
        match self {
            RunEvent::Data(s) | RunEvent::Error(s, _) => s,
        }
    }
}

/// Fire-and-forget sink. Emission never blocks the loop, and a dropped
/// receiver only silences further events.
#[derive(Clone, Default)]
pub struct EventBus {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl EventBus {
    pub fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A connected bus plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: RunEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.send(event).is_err() {
            tracing::trace!("run event dropped, receiver closed");
        }
    }
}
