//! # OCPP Charge Point Core
//!
//! OCPP 1.6J charge point engine: connector sessions, transactions and the
//! WebSocket link to a Central System.
//!
//! ## Architecture
//!
//! ```text
//!   Application (RFID reader, power stage, meter)
//!       │ ChargePoint API          ▲ notify callback
//!       ▼                          │
//! ┌───────────────────────────────────────────┐
//! │ ocpp-cp-core                              │
//! │  ┌──────────────┐    ┌─────────────────┐  │
//! │  │ Connector    │◄──►│ Event bus       │  │
//! │  │ workers (1/n)│    │ (broadcast)     │  │
//! │  └──────┬───────┘    └───────▲─────────┘  │
//! │         │ sessions           │ events     │
//! │  ┌──────▼───────┐    ┌───────┴─────────┐  │
//! │  │ Session table│◄───│ Dispatcher      │  │
//! │  └──────────────┘    └───────▲─────────┘  │
//! │  ┌──────────────┐    ┌───────┴─────────┐  │
//! │  │ Controller   │───►│ Correlator      │  │
//! │  │ boot/hb/retry│    │ pending calls   │  │
//! │  └──────────────┘    └───────┬─────────┘  │
//! └──────────────────────────────┼────────────┘
//!                                │ WebSocket "ocpp1.6"
//!                                ▼
//!                         Central System
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_cp_core::{
//!     CentralSystemEndpoint, ChargePoint, ChargePointIdentity, EngineConfig, Notify, NotifyReply,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     ocpp_cp_core::logging::init("info").ok();
//!
//!     let config = EngineConfig::new(
//!         ChargePointIdentity::new("Elektrokombinacija", "EK3-OCPP").with_connectors(2),
//!         CentralSystemEndpoint::new("localhost", 8180, "steve/websocket/CentralSystemService"),
//!     );
//!
//!     let charge_point = ChargePoint::init(
//!         config,
//!         Arc::new(|notify: Notify| match notify {
//!             Notify::GetMeterValue { .. } => Ok(NotifyReply::Reading("0".into())),
//!             _ => Ok(NotifyReply::Ack),
//!         }),
//!     )?;
//!
//!     charge_point.present_credential(1, "04E91C5A")?;
//!     tokio::signal::ctrl_c().await?;
//!     charge_point.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
mod connector;
mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod meter;
pub mod ocpp;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod transport;

pub use config::{
    AddressFamily, CentralSystemEndpoint, ChargeLimits, ChargePointIdentity, EngineConfig,
    MeterConfig, TransportConfig,
};
pub use dispatcher::{CommandDispatcher, ConnectorTarget, DispatchError};
pub use engine::ChargePoint;
pub use error::{
    CallError, ConfigError, ConnectError, EngineError, NotifyError, SendError, SessionError,
};
pub use events::{CredentialOrigin, EngineEvent, EventBus};
pub use meter::{
    MeterProvider, MeterReading, Notify, NotifyCallback, NotifyMeterProvider, NotifyReply,
};
pub use retry::RetryPolicy;
pub use rpc::{CallFault, CallHandler, Correlator};
pub use session::{SessionHandle, SessionSnapshot, SessionState, SessionTable, TransactionSummary};
pub use transport::Transport;

// Re-export key protocol types
pub use ocpp::{Action, AuthorizationStatus, Measurand, Reason};
