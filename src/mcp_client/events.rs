//! Outbound server events.
//!
//! Connection managers and the executor publish `ServerEvent`s on one
//! broadcast bus. Events of a given server are sent from that server's
//! serialized paths, so subscribers see them in per-server FIFO order.
//! A subscriber that falls behind loses the oldest events (`Lagged`).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::types::ServerStatus;

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 256;

/// Something that happened to a server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    StatusChanged {
        server_id: String,
        status: ServerStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        at: DateTime<Utc>,
    },
    CatalogRefreshed {
        server_id: String,
        tool_count: usize,
    },
    ToolExecuted {
        server_id: String,
        tool_name: String,
        execution_id: Uuid,
        success: bool,
        elapsed_ms: u64,
    },
    ReconnectScheduled {
        server_id: String,
        attempt: u32,
        delay_ms: u64,
    },
}

impl ServerEvent {
    pub fn server_id(&self) -> &str {
        match self {
            Self::StatusChanged { server_id, .. }
            | Self::CatalogRefreshed { server_id, .. }
            | Self::ToolExecuted { server_id, .. }
            | Self::ReconnectScheduled { server_id, .. } => server_id,
        }
    }
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ServerEvent::StatusChanged {
            server_id: "a".into(),
            status: ServerStatus::Connecting,
            error: None,
            at: Utc::now(),
        });
        bus.emit(ServerEvent::CatalogRefreshed {
            server_id: "a".into(),
            tool_count: 2,
        });

        assert!(matches!(rx.recv().await.unwrap(), ServerEvent::StatusChanged { .. }));
        match rx.recv().await.unwrap() {
            ServerEvent::CatalogRefreshed { tool_count, .. } => assert_eq!(tool_count, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(ServerEvent::ReconnectScheduled {
            server_id: "a".into(),
            attempt: 1,
            delay_ms: 10,
        });
    }

    #[test]
    fn test_event_serialization() {
        let event = ServerEvent::ReconnectScheduled {
            server_id: "fs".into(),
            attempt: 2,
            delay_ms: 2000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "reconnect_scheduled");
        assert_eq!(json["server_id"], "fs");
        assert_eq!(event.server_id(), "fs");
    }
}
