//! Engine event channel
//!
//! Every cross-task signal (credential presented, remote stop, transport
//! lost, boot accepted, shutdown) is published here. Connector workers
//! subscribe and filter by connector id.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::ocpp::Reason;
use crate::session::{SessionHandle, SessionState, TransactionSummary};

/// Where a credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    /// Presented at the charge point (RFID reader, app, ...)
    Local,
    /// RemoteStartTransaction from the Central System
    Remote,
}

/// Events published on the engine bus
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Transport connected, BootNotification not yet accepted
    Connected,
    /// Central System accepted BootNotification
    BootAccepted { heartbeat_interval: Duration },
    /// Central System rejected BootNotification; the engine stops
    BootRejected,
    /// Connection to the Central System dropped
    TransportLost,
    /// A driver credential is waiting on a connector. The slot is already
    /// claimed; `handle` passes to the connector's worker.
    Credential {
        connector_id: u32,
        id_tag: String,
        origin: CredentialOrigin,
        handle: SessionHandle,
    },
    /// Stop the running transaction on a connector
    StopRequested { connector_id: u32, reason: Reason },
    /// Release the connector lock
    Unlock { connector_id: u32 },
    /// A session changed state
    StateChanged {
        connector_id: u32,
        from: SessionState,
        to: SessionState,
    },
    TransactionStarted { connector_id: u32, transaction_id: i32 },
    TransactionStopped {
        connector_id: u32,
        summary: TransactionSummary,
    },
    /// The engine is shutting down
    Shutdown,
}

impl EngineEvent {
    /// Connector the event targets, if any
    pub fn connector_id(&self) -> Option<u32> {
        match self {
            EngineEvent::Credential { connector_id, .. }
            | EngineEvent::StopRequested { connector_id, .. }
            | EngineEvent::Unlock { connector_id }
            | EngineEvent::StateChanged { connector_id, .. }
            | EngineEvent::TransactionStarted { connector_id, .. }
            | EngineEvent::TransactionStopped { connector_id, .. } => Some(*connector_id),
            _ => None,
        }
    }
}

/// Publish/subscribe channel shared by all engine tasks
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
