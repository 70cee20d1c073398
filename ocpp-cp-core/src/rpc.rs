//! Request/response correlation
//!
//! Every outbound Call gets a fresh unique id and an entry in the pending
//! table. The entry is removed exactly once: by the matching response, by
//! the call's timeout, by the caller dropping the future, or by `detach`
//! when the connection goes away.
//!
//! Inbound Calls are handed to the registered [`CallHandler`] and answered
//! on the same connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::ocpp::messages::{self, Call, CallResult, Frame, FrameError};
use crate::ocpp::{Action, ErrorCode, OcppRequest};

/// Handler for Calls initiated by the Central System
pub trait CallHandler: Send + Sync {
    /// Produce the response payload, or the error to answer with
    fn handle_call(&self, action: Action, payload: Value) -> Result<Value, CallFault>;
}

/// Error answer to an inbound Call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFault {
    pub code: ErrorCode,
    pub description: String,
}

impl CallFault {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// Outbound call awaiting its response
struct PendingCall {
    action: Action,
    created_at: Instant,
    completion: oneshot::Sender<Result<Value, CallError>>,
}

struct Link {
    epoch: u64,
    outgoing: mpsc::Sender<String>,
}

/// Correlates outbound Calls with their responses over the current link
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingCall>>,
    link: RwLock<Option<Link>>,
    epochs: AtomicU64,
    registered: AtomicBool,
    handler: RwLock<Option<Arc<dyn CallHandler>>>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            link: RwLock::new(None),
            epochs: AtomicU64::new(0),
            registered: AtomicBool::new(false),
            handler: RwLock::new(None),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn CallHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Route outbound frames to a new connection; returns the link epoch
    pub fn attach(&self, outgoing: mpsc::Sender<String>) -> u64 {
        let epoch = self.epochs.fetch_add(1, Ordering::AcqRel) + 1;
        *self.link.write() = Some(Link { epoch, outgoing });
        debug!(epoch, "Correlator attached");
        epoch
    }

    /// Drop the current link and fail every pending call
    pub fn detach(&self) {
        self.link.write().take();
        self.fail_pending();
    }

    /// Detach only if `epoch` is still the current link
    pub fn detach_epoch(&self, epoch: u64) {
        {
            let mut link = self.link.write();
            if !link.as_ref().is_some_and(|current| current.epoch == epoch) {
                return;
            }
            link.take();
        }
        self.fail_pending();
    }

    fn fail_pending(&self) {
        self.registered.store(false, Ordering::Release);
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Failing pending calls on disconnect");
        }
        for pending in drained {
            let _ = pending
                .completion
                .send(Err(CallError::ConnectionClosed(pending.action)));
        }
    }

    /// Whether `epoch` is the link currently attached
    pub fn is_current(&self, epoch: u64) -> bool {
        self.link.read().as_ref().is_some_and(|l| l.epoch == epoch)
    }

    pub fn is_attached(&self) -> bool {
        self.link.read().is_some()
    }

    /// Open the gate for calls other than BootNotification
    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Number of calls awaiting a response
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a typed request and decode its response
    pub async fn send<R: OcppRequest>(
        &self,
        request: &R,
        timeout: Duration,
    ) -> Result<R::Response, CallError> {
        let payload = serde_json::to_value(request).map_err(|e| CallError::Encode {
            action: R::ACTION,
            source: FrameError::Json(e),
        })?;
        let response = self.call(R::ACTION, payload, timeout).await?;
        serde_json::from_value(response).map_err(|source| CallError::Decode {
            action: R::ACTION,
            source,
        })
    }

    /// Send a raw Call and wait at most `timeout` for its response
    pub async fn call(
        &self,
        action: Action,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        if action != Action::BootNotification && !self.is_registered() {
            return Err(CallError::NotConnected);
        }
        let outgoing = self
            .link
            .read()
            .as_ref()
            .map(|l| l.outgoing.clone())
            .ok_or(CallError::NotConnected)?;

        let call = Call::new(action, payload);
        let text = call
            .to_text()
            .map_err(|source| CallError::Encode { action, source })?;

        let (completion, response) = oneshot::channel();
        self.pending.lock().insert(
            call.message_id.clone(),
            PendingCall {
                action,
                created_at: Instant::now(),
                completion,
            },
        );
        let _guard = PendingGuard {
            correlator: self,
            message_id: &call.message_id,
        };

        let exchange = async {
            outgoing
                .send(text)
                .await
                .map_err(|_| CallError::ConnectionClosed(action))?;
            response
                .await
                .map_err(|_| CallError::ConnectionClosed(action))?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    message_id = %call.message_id,
                    action = %action,
                    timeout_ms = timeout.as_millis() as u64,
                    "Call timed out"
                );
                Err(CallError::Timeout {
                    action,
                    after: timeout,
                })
            }
        }
    }

    /// Process one inbound text frame
    pub async fn handle_frame(&self, text: &str) {
        match Frame::parse(text) {
            Ok(Frame::CallResult(result)) => self.resolve(&result.message_id, Ok(result.payload)),
            Ok(Frame::CallError(error)) => {
                let message_id = error.message_id.clone();
                self.resolve_error(&message_id, error);
            }
            Ok(Frame::Call(call)) => {
                let reply = self.dispatch(call);
                self.reply(reply).await;
            }
            Err(FrameError::UnknownAction { message_id, action }) => {
                warn!("Unsupported action {} in call {}", action, message_id);
                let reply = messages::CallError::new(
                    message_id,
                    ErrorCode::NotImplemented,
                    format!("Action {} is not implemented", action),
                );
                self.reply(Frame::CallError(reply)).await;
            }
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }

    fn resolve(&self, message_id: &str, result: Result<Value, CallError>) {
        let Some(pending) = self.pending.lock().remove(message_id) else {
            debug!("Discarding response to unknown or expired call {}", message_id);
            return;
        };
        debug!(
            message_id,
            action = %pending.action,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "Call completed"
        );
        let _ = pending.completion.send(result);
    }

    fn resolve_error(&self, message_id: &str, error: messages::CallError) {
        let action = match self.pending.lock().get(message_id) {
            Some(pending) => pending.action,
            None => {
                debug!("Discarding error for unknown or expired call {}", message_id);
                return;
            }
        };
        self.resolve(
            message_id,
            Err(CallError::Remote {
                action,
                code: error.error_code,
                description: error.error_description,
            }),
        );
    }

    fn dispatch(&self, call: Call) -> Frame {
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            return Frame::CallError(messages::CallError::new(
                call.message_id,
                ErrorCode::NotSupported,
                "No handler registered",
            ));
        };

        debug!("Central System call: {} ({})", call.action, call.message_id);
        match handler.handle_call(call.action, call.payload) {
            Ok(payload) => Frame::CallResult(CallResult::new(call.message_id, payload)),
            Err(fault) => Frame::CallError(messages::CallError::new(
                call.message_id,
                fault.code,
                fault.description,
            )),
        }
    }

    async fn reply(&self, frame: Frame) {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode reply {}: {}", frame.message_id(), e);
                return;
            }
        };
        let outgoing = self.link.read().as_ref().map(|l| l.outgoing.clone());
        match outgoing {
            Some(outgoing) => {
                if outgoing.send(text).await.is_err() {
                    warn!("Connection closed before reply {} was sent", frame.message_id());
                }
            }
            None => warn!("Not connected, dropping reply {}", frame.message_id()),
        }
    }
}

/// Removes the pending entry however the call ends
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    message_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.pending.lock().remove(self.message_id);
    }
}
