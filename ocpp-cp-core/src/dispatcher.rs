//! Central System command dispatch
//!
//! Remote commands are validated against the session table and turned into
//! engine events. A remote start claims its connector's slot before the
//! credential is published; everything else is left to the connector worker.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{CredentialOrigin, EngineEvent, EventBus};
use crate::ocpp::{
    Action, ErrorCode, Reason, RemoteStartStopStatus, RemoteStartTransactionRequest,
    RemoteStartTransactionResponse, RemoteStopTransactionRequest, RemoteStopTransactionResponse,
    UnlockConnectorRequest, UnlockConnectorResponse, UnlockStatus,
};
use crate::error::SessionError;
use crate::rpc::{CallFault, CallHandler};
use crate::session::{SessionState, SessionTable};

/// Connector a remote start applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorTarget {
    Connector(u32),
    /// Lowest-numbered free connector
    AnyFree,
}

impl From<Option<u32>> for ConnectorTarget {
    fn from(connector_id: Option<u32>) -> Self {
        match connector_id {
            Some(id) => ConnectorTarget::Connector(id),
            None => ConnectorTarget::AnyFree,
        }
    }
}

/// Why a remote command was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Unknown connector {0}")]
    UnknownConnector(u32),

    #[error("Connector {0} is busy")]
    ConnectorBusy(u32),

    #[error("No free connector")]
    NoFreeConnector,
}

/// Turns remote commands into engine events
pub struct CommandDispatcher {
    sessions: Arc<SessionTable>,
    events: EventBus,
}

impl CommandDispatcher {
    pub fn new(sessions: Arc<SessionTable>, events: EventBus) -> Self {
        Self { sessions, events }
    }

    /// Claim a connector for a remote credential; returns the chosen connector
    pub fn on_remote_start(
        &self,
        target: ConnectorTarget,
        id_tag: &str,
    ) -> Result<u32, DispatchError> {
        let handle = match target {
            ConnectorTarget::Connector(id) => self.sessions.open(id).map_err(|e| match e {
                SessionError::UnknownConnector(_) => DispatchError::UnknownConnector(id),
                _ => DispatchError::ConnectorBusy(id),
            })?,
            ConnectorTarget::AnyFree => self
                .sessions
                .open_first_free()
                .ok_or(DispatchError::NoFreeConnector)?,
        };
        let connector_id = handle.connector_id();

        info!(connector_id, id_tag, "Remote start accepted");
        self.events.publish(EngineEvent::Credential {
            connector_id,
            id_tag: id_tag.to_string(),
            origin: CredentialOrigin::Remote,
            handle,
        });
        Ok(connector_id)
    }

    /// Ask the connector to stop; a connector that is not charging is left alone
    pub fn on_remote_stop(&self, connector_id: u32) -> Result<(), DispatchError> {
        let state = self
            .sessions
            .state(connector_id)
            .map_err(|_| DispatchError::UnknownConnector(connector_id))?;
        if state != SessionState::Charging {
            debug!(connector_id, ?state, "Remote stop ignored, not charging");
            return Ok(());
        }

        info!(connector_id, "Remote stop requested");
        self.events.publish(EngineEvent::StopRequested {
            connector_id,
            reason: Reason::Remote,
        });
        Ok(())
    }

    pub fn on_unlock(&self, connector_id: u32) -> Result<(), DispatchError> {
        self.sessions
            .state(connector_id)
            .map_err(|_| DispatchError::UnknownConnector(connector_id))?;

        info!(connector_id, "Unlock requested");
        self.events.publish(EngineEvent::Unlock { connector_id });
        Ok(())
    }

    fn remote_start(
        &self,
        request: RemoteStartTransactionRequest,
    ) -> RemoteStartTransactionResponse {
        let status = match self.on_remote_start(request.connector_id.into(), &request.id_tag) {
            Ok(_) => RemoteStartStopStatus::Accepted,
            Err(e) => {
                info!("Remote start rejected: {}", e);
                RemoteStartStopStatus::Rejected
            }
        };
        RemoteStartTransactionResponse { status }
    }

    fn remote_stop(&self, request: RemoteStopTransactionRequest) -> RemoteStopTransactionResponse {
        // An unknown transaction is already stopped
        if let Some(connector_id) = self.sessions.find_transaction(request.transaction_id) {
            if let Err(e) = self.on_remote_stop(connector_id) {
                info!("Remote stop failed: {}", e);
            }
        } else {
            debug!(
                transaction_id = request.transaction_id,
                "Remote stop for unknown transaction"
            );
        }
        RemoteStopTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        }
    }

    fn unlock(&self, request: UnlockConnectorRequest) -> UnlockConnectorResponse {
        let status = match self.on_unlock(request.connector_id) {
            Ok(()) => UnlockStatus::Unlocked,
            Err(_) => UnlockStatus::NotSupported,
        };
        UnlockConnectorResponse { status }
    }
}

fn decode<T: DeserializeOwned>(action: Action, payload: Value) -> Result<T, CallFault> {
    serde_json::from_value(payload).map_err(|e| {
        CallFault::new(
            ErrorCode::FormationViolation,
            format!("Invalid {} payload: {}", action, e),
        )
    })
}

fn encode<T: Serialize>(response: &T) -> Result<Value, CallFault> {
    serde_json::to_value(response)
        .map_err(|e| CallFault::new(ErrorCode::InternalError, e.to_string()))
}

impl CallHandler for CommandDispatcher {
    fn handle_call(&self, action: Action, payload: Value) -> Result<Value, CallFault> {
        match action {
            Action::RemoteStartTransaction => encode(&self.remote_start(decode(action, payload)?)),
            Action::RemoteStopTransaction => encode(&self.remote_stop(decode(action, payload)?)),
            Action::UnlockConnector => encode(&self.unlock(decode(action, payload)?)),
            other => Err(CallFault::new(
                ErrorCode::NotSupported,
                format!("{} is not accepted from the Central System", other),
            )),
        }
    }
}
