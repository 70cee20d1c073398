//! OCPP 1.6J protocol layer
//!
//! - `messages`: JSON-RPC framing (CALL, CALLRESULT, CALLERROR)
//! - `types`: 1.6 payloads for the actions the engine handles

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
