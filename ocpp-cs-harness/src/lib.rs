//! # OCPP Central System Harness
//!
//! Scriptable in-process OCPP 1.6J Central System for charge point
//! integration tests. Speaks the wire protocol directly so it shares no
//! code with the engine under test.

pub mod behavior;
pub mod central_system;

pub use behavior::{BootReply, CsBehavior};
pub use central_system::{FakeCentralSystem, HarnessError, RecordedCall};
