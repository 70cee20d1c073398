//! Error types for the charge point engine
//!
//! Layered the way failures are recovered:
//! - `ConnectError` / `SendError`: transport, recovered by the controller
//! - `CallError`: one outbound RPC, surfaced to the caller
//! - `SessionError`: misuse of a connector session
//! - `EngineError`: what the public API returns

use std::time::Duration;

use thiserror::Error;

use crate::ocpp::{Action, ErrorCode, FrameError};
use crate::session::SessionState;

/// Failure to establish the Central System connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No {family} address found for {host}")]
    NoAddress { host: String, family: String },

    #[error("Connection refused by {addr}: {source}")]
    Refused {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

/// Failure to queue an outbound frame
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Connection closed")]
    Closed,
}

/// Failure of a single outbound call
#[derive(Debug, Error)]
pub enum CallError {
    #[error("{action} timed out after {after:?}")]
    Timeout { action: Action, after: Duration },

    #[error("Connection closed before {0} completed")]
    ConnectionClosed(Action),

    #[error("Not connected to Central System")]
    NotConnected,

    #[error("Central System answered {action} with {code}: {description}")]
    Remote {
        action: Action,
        code: ErrorCode,
        description: String,
    },

    #[error("Failed to encode {action}: {source}")]
    Encode {
        action: Action,
        #[source]
        source: FrameError,
    },

    #[error("Failed to decode {action} response: {source}")]
    Decode {
        action: Action,
        #[source]
        source: serde_json::Error,
    },
}

impl CallError {
    /// Transient failures worth retrying: the request may not have reached
    /// the Central System, or its answer may not have reached us.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Timeout { .. } | CallError::ConnectionClosed(_) | CallError::NotConnected
        )
    }
}

/// Misuse of a connector session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Unknown connector {0}")]
    UnknownConnector(u32),

    #[error("Connector {0} already has an open session")]
    Busy(u32),

    #[error("Session handle for connector {0} is no longer valid")]
    StaleHandle(u32),

    #[error("Connector {connector_id}: illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        connector_id: u32,
        from: SessionState,
        to: SessionState,
    },

    #[error("Connector {0}: not authorized")]
    NotAuthorized(u32),

    #[error("Connector {0}: another session is already charging")]
    AlreadyCharging(u32),

    #[error("Handle is bound to connector {handle}, not {requested}")]
    ConnectorMismatch { handle: u32, requested: u32 },

    #[error("Connector {0}: no active transaction")]
    NoTransaction(u32),
}

/// Invalid engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("connector_count must be at least 1")]
    NoConnectors,

    #[error("Central System host is empty")]
    EmptyHost,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("authorize retry needs at least one attempt")]
    NoAttempts,

    #[error("charge point needs a vendor and model")]
    MissingIdentity,
}

/// Failure reported by the application's notify callback
#[derive(Debug, Clone, Error)]
#[error("Notify callback failed: {0}")]
pub struct NotifyError(pub String);

/// Errors returned by the public engine surface
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// BootNotification was rejected; fatal, reported once
    #[error("Central System rejected BootNotification")]
    BootRejected,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// StartTransaction was answered with a non-Accepted idTagInfo
    #[error("Central System refused transaction start: {0:?}")]
    StartRefused(crate::ocpp::AuthorizationStatus),

    #[error("Engine is shut down")]
    Shutdown,

    #[error("Engine must be started inside a tokio runtime")]
    NoRuntime,
}

impl EngineError {
    /// Whether this error is a configuration failure that must not be retried
    pub fn is_configuration(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::BootRejected)
    }
}
