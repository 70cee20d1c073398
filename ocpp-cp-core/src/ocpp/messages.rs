//! OCPP-J message framing
//!
//! OCPP 1.6J carries RPC frames as JSON arrays over WebSocket text messages:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 RPC framework error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // OCPP 1.6J spells it this way on the wire.
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP 1.6 action names handled by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // Charge point -> Central System
    Authorize,
    BootNotification,
    Heartbeat,
    MeterValues,
    StartTransaction,
    StatusNotification,
    StopTransaction,

    // Central System -> charge point
    RemoteStartTransaction,
    RemoteStopTransaction,
    UnlockConnector,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::UnlockConnector => "UnlockConnector",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authorize" => Ok(Action::Authorize),
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "MeterValues" => Ok(Action::MeterValues),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StatusNotification" => Ok(Action::StatusNotification),
            "StopTransaction" => Ok(Action::StopTransaction),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "UnlockConnector" => Ok(Action::UnlockConnector),
            other => Err(other.to_string()),
        }
    }
}

/// Errors while decoding or encoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    /// A CALL whose action is not supported; the id is kept so the
    /// receiver can still answer with a CALLERROR.
    #[error("Unknown action {action} in call {message_id}")]
    UnknownAction { message_id: String, action: String },
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with a fresh unique id
    pub fn new(action: Action, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            action,
            payload,
        }
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_text(&self) -> Result<String, FrameError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.as_str(),
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_text(&self) -> Result<String, FrameError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_text(&self) -> Result<String, FrameError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// Parsed OCPP frame (any type)
#[derive(Debug, Clone)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    /// Parse an OCPP frame from a WebSocket text message
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let array: Vec<Value> = serde_json::from_str(text)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(FrameError::InvalidFormat)?;

        let message_id = array
            .get(1)
            .and_then(Value::as_str)
            .ok_or(FrameError::InvalidFormat)?
            .to_string();

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(FrameError::InvalidFormat);
                }
                let action_str = array[2].as_str().ok_or(FrameError::InvalidFormat)?;
                let action = action_str
                    .parse::<Action>()
                    .map_err(|action| FrameError::UnknownAction {
                        message_id: message_id.clone(),
                        action,
                    })?;

                Ok(Frame::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(FrameError::InvalidFormat);
                }
                Ok(Frame::CallResult(CallResult {
                    message_id,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(FrameError::InvalidFormat);
                }
                let error_code = array[2]
                    .as_str()
                    .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
                    .unwrap_or(ErrorCode::GenericError);

                Ok(Frame::CallError(CallError {
                    message_id,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array[4].clone(),
                }))
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    pub fn to_text(&self) -> Result<String, FrameError> {
        match self {
            Frame::Call(c) => c.to_text(),
            Frame::CallResult(r) => r.to_text(),
            Frame::CallError(e) => e.to_text(),
        }
    }
}
