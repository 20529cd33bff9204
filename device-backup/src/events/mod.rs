//! Backup lifecycle events.
//!
//! The orchestrator publishes on a broadcast channel; any number of
//! consumers (the CLI, a UI bridge) subscribe independently.

use crate::executor::BackupResult;
use crate::transfer::progress::BackupProgress;
use crate::utils::BackupErrorCode;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "progress")]
    Progress(BackupProgress),

    /// A run failed; always followed by `Complete`
    #[serde(rename = "error")]
    Error { code: BackupErrorCode, message: String },

    #[serde(rename = "complete")]
    Complete(BackupResult),

    /// The device encrypts its backups and no password was supplied
    #[serde(rename = "password-required")]
    PasswordRequired { device_id: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: BackupEvent) {
        match self.tx.send(event) {
            Ok(count) => debug!("Delivered event to {} subscriber(s)", count),
            Err(_) => debug!("No event subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::progress::BackupPhase;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(BackupEvent::PasswordRequired {
            device_id: "abc".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let event = BackupEvent::Progress(BackupProgress::milestone(BackupPhase::Preparing, 0.0));
        bus.emit(event.clone());

        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_event_serialization() {
        let event = BackupEvent::PasswordRequired {
            device_id: "00008030-001".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"password-required","payload":{"device_id":"00008030-001"}}"#
        );

        let event = BackupEvent::Error {
            code: BackupErrorCode::DeviceLocked,
            message: "locked".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains("DEVICE_LOCKED"));

        let parsed: BackupEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
