//! Observer channel for queue activity
//!
//! Every [`crate::queue::FairQueue`] owns a broadcast sender. Subscribers get
//! a copy of each event sent after they subscribed; a slow subscriber lags and
//! loses the oldest events rather than slowing the queue down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Something worth telling an observer about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// An operation or callback failed
    Error {
        message: String,
        correlation_id: Option<String>,
    },

    /// Unexpected but tolerated condition (e.g. release of an unknown token)
    Warning { message: String },

    /// A dispatch slot was given back
    Released {
        destination: String,
        correlation_id: String,
        requeued: bool,
    },

    /// Wake-up recovery finished
    WokeUp { recovered: usize },

    /// A removed job was skipped at dispatch time
    Discarded {
        destination: String,
        correlation_id: String,
    },
}

/// Broadcast sender shared by the queue and its worker loop
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events sent from now on
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Send an event; having no subscriber is not an error
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub fn error(&self, message: impl Into<String>, correlation_id: Option<String>) {
        self.emit(QueueEvent::Error {
            message: message.into(),
            correlation_id,
        });
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(QueueEvent::Warning {
            message: message.into(),
        });
    }
}
