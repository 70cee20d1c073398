//! In-process fake Central System
//!
//! Listens on 127.0.0.1, accepts one charge point connection at a time,
//! records every Call it receives and answers according to a
//! [`CsBehavior`]. Tests can also send Central System initiated calls and
//! cut the connection to simulate a transport loss.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::behavior::{BootReply, CsBehavior};

const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Harness failures
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("No charge point connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Charge point answered with {code}: {description}")]
    CallError { code: String, description: String },
}

/// A Call received from the charge point
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// 1-based connection counter
    pub connection: u32,
    pub message_id: String,
    pub action: String,
    pub payload: Value,
    pub received_at: Instant,
}

struct Connection {
    id: u32,
    outgoing: mpsc::Sender<String>,
    kill: Option<oneshot::Sender<()>>,
}

struct Shared {
    behavior: Mutex<CsBehavior>,
    calls: Mutex<Vec<RecordedCall>>,
    connection: Mutex<Option<Connection>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value, HarnessError>>>>,
    paths: Mutex<Vec<String>>,
    subprotocols: Mutex<Vec<Option<String>>>,
    connections: AtomicU32,
    next_transaction_id: AtomicI32,
    changed: Notify,
}

/// Fake OCPP 1.6 Central System
pub struct FakeCentralSystem {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl FakeCentralSystem {
    /// Bind an ephemeral port and start accepting
    pub async fn start(behavior: CsBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            next_transaction_id: AtomicI32::new(behavior.first_transaction_id),
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
            connection: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            paths: Mutex::new(Vec::new()),
            subprotocols: Mutex::new(Vec::new()),
            connections: AtomicU32::new(0),
            changed: Notify::new(),
        });

        let accept_shared = shared.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Charge point connected from {}", peer);
                        tokio::spawn(serve(stream, accept_shared.clone()));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        info!("Fake Central System listening on {}", addr);
        Ok(Self {
            addr,
            shared,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Change the behavior for calls received from now on
    pub fn update_behavior(&self, update: impl FnOnce(&mut CsBehavior)) {
        update(&mut self.shared.behavior.lock());
    }

    /// Connections accepted so far
    pub fn connection_count(&self) -> u32 {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// Request paths of every accepted handshake
    pub fn request_paths(&self) -> Vec<String> {
        self.shared.paths.lock().clone()
    }

    /// Sec-WebSocket-Protocol offered on every accepted handshake
    pub fn offered_subprotocols(&self) -> Vec<Option<String>> {
        self.shared.subprotocols.lock().clone()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.calls.lock().clone()
    }

    pub fn calls_for(&self, action: &str) -> Vec<RecordedCall> {
        self.shared
            .calls
            .lock()
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` calls of `action` were received
    pub async fn wait_for_calls(
        &self,
        action: &str,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<RecordedCall>, HarnessError> {
        self.wait_until(
            |calls| {
                let matching: Vec<_> =
                    calls.iter().filter(|c| c.action == action).cloned().collect();
                (matching.len() >= count).then_some(matching)
            },
            timeout,
        )
        .await
        .map_err(|_| HarnessError::Timeout(format!("{} x{}", action, count)))
    }

    /// Wait for a call of `action` whose payload satisfies `matches`
    pub async fn wait_for_call_matching(
        &self,
        action: &str,
        matches: impl Fn(&Value) -> bool,
        timeout: Duration,
    ) -> Result<RecordedCall, HarnessError> {
        self.wait_until(
            |calls| {
                calls
                    .iter()
                    .find(|c| c.action == action && matches(&c.payload))
                    .cloned()
            },
            timeout,
        )
        .await
        .map_err(|_| HarnessError::Timeout(format!("matching {}", action)))
    }

    async fn wait_until<T>(
        &self,
        check: impl Fn(&[RecordedCall]) -> Option<T>,
        timeout: Duration,
    ) -> Result<T, HarnessError> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.shared.changed.notified();
            if let Some(found) = check(&self.shared.calls.lock()) {
                return Ok(found);
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(HarnessError::Timeout("condition".into()));
            }
        }
    }

    /// Wait until a charge point is connected
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), HarnessError> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.shared.changed.notified();
            if self.shared.connection.lock().is_some() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return Err(HarnessError::Timeout("connection".into()));
            }
        }
    }

    /// Send a Central System initiated Call and wait for the answer payload
    pub async fn send_call(
        &self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, HarnessError> {
        let message_id = Uuid::new_v4().to_string();
        let text = json!([2, &message_id, action, payload]).to_string();

        let outgoing = self
            .shared
            .connection
            .lock()
            .as_ref()
            .map(|c| c.outgoing.clone())
            .ok_or(HarnessError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(message_id.clone(), tx);

        if outgoing.send(text).await.is_err() {
            self.shared.pending.lock().remove(&message_id);
            return Err(HarnessError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HarnessError::Closed),
            Err(_) => {
                self.shared.pending.lock().remove(&message_id);
                Err(HarnessError::Timeout(action.to_string()))
            }
        }
    }

    pub async fn remote_start(
        &self,
        connector_id: Option<u32>,
        id_tag: &str,
    ) -> Result<Value, HarnessError> {
        let mut payload = json!({ "idTag": id_tag });
        if let Some(connector_id) = connector_id {
            payload["connectorId"] = json!(connector_id);
        }
        self.send_call("RemoteStartTransaction", payload, Duration::from_secs(5))
            .await
    }

    pub async fn remote_stop(&self, transaction_id: i32) -> Result<Value, HarnessError> {
        self.send_call(
            "RemoteStopTransaction",
            json!({ "transactionId": transaction_id }),
            Duration::from_secs(5),
        )
        .await
    }

    pub async fn unlock(&self, connector_id: u32) -> Result<Value, HarnessError> {
        self.send_call(
            "UnlockConnector",
            json!({ "connectorId": connector_id }),
            Duration::from_secs(5),
        )
        .await
    }

    /// Close the current connection; the charge point sees a transport loss
    pub fn drop_connection(&self) {
        let connection = self.shared.connection.lock().take();
        if let Some(mut connection) = connection {
            info!("Dropping charge point connection {}", connection.id);
            if let Some(kill) = connection.kill.take() {
                let _ = kill.send(());
            }
        }
    }
}

impl Drop for FakeCentralSystem {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connection();
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let handshake_shared = shared.clone();
    let callback =
        move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            handshake_shared
                .paths
                .lock()
                .push(request.uri().path().to_string());
            let offered = request
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if offered
                .as_deref()
                .is_some_and(|p| p.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL))
            {
                response.headers_mut().insert(
                    header::SEC_WEBSOCKET_PROTOCOL,
                    HeaderValue::from_static(OCPP_SUBPROTOCOL),
                );
            }
            handshake_shared.subprotocols.lock().push(offered);
            Ok(response)
        };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Handshake failed: {}", e);
            return;
        }
    };

    let id = shared.connections.fetch_add(1, Ordering::AcqRel) + 1;
    let (outgoing, mut outgoing_rx) = mpsc::channel::<String>(64);
    let (kill, mut killed) = oneshot::channel();
    *shared.connection.lock() = Some(Connection {
        id,
        outgoing: outgoing.clone(),
        kill: Some(kill),
    });
    shared.changed.notify_waiters();

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = &mut killed => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            msg = outgoing_rx.recv() => {
                let Some(text) = msg else { break };
                debug!("CS sending: {}", text);
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_frame(&shared, id, &text) {
                            debug!("CS sending: {}", reply);
                            if sink.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    {
        let mut connection = shared.connection.lock();
        if connection.as_ref().is_some_and(|c| c.id == id) {
            connection.take();
        }
    }
    // CS-initiated calls still waiting on this connection
    for (_, pending) in shared.pending.lock().drain() {
        let _ = pending.send(Err(HarnessError::Closed));
    }
    shared.changed.notify_waiters();
    info!("Charge point connection {} closed", id);
}

/// Record an inbound frame; returns the reply to send, if any
fn handle_frame(shared: &Shared, connection: u32, text: &str) -> Option<String> {
    debug!("CS received: {}", text);
    let frame: Vec<Value> = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Unparsable frame from charge point: {}", e);
            return None;
        }
    };
    let message_type = frame.first().and_then(Value::as_i64)?;
    let message_id = frame.get(1).and_then(Value::as_str)?.to_string();

    match message_type {
        2 => {
            let action = frame.get(2).and_then(Value::as_str)?.to_string();
            let payload = frame.get(3).cloned().unwrap_or(Value::Null);
            let reply = answer(shared, &action, &payload);

            shared.calls.lock().push(RecordedCall {
                connection,
                message_id: message_id.clone(),
                action: action.clone(),
                payload,
                received_at: Instant::now(),
            });
            shared.changed.notify_waiters();

            reply.map(|reply| match reply {
                Ok(payload) => json!([3, message_id, payload]).to_string(),
                Err((code, description)) => {
                    json!([4, message_id, code, description, {}]).to_string()
                }
            })
        }
        3 | 4 => {
            let result = if message_type == 3 {
                Ok(frame.get(2).cloned().unwrap_or(Value::Null))
            } else {
                Err(HarnessError::CallError {
                    code: frame.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
                    description: frame.get(3).and_then(Value::as_str).unwrap_or("").to_string(),
                })
            };
            if let Some(pending) = shared.pending.lock().remove(&message_id) {
                let _ = pending.send(result);
            }
            None
        }
        _ => None,
    }
}

/// Scripted answer to a charge point Call; `None` means stay silent
fn answer(
    shared: &Shared,
    action: &str,
    payload: &Value,
) -> Option<Result<Value, (String, String)>> {
    let mut behavior = shared.behavior.lock();
    if behavior.is_silent(action) {
        return None;
    }
    let now = Utc::now().to_rfc3339();
    let id_tag = payload.get("idTag").and_then(Value::as_str).unwrap_or("");

    let reply = match action {
        "BootNotification" => {
            if behavior.pending_boots > 0 {
                behavior.pending_boots -= 1;
                json!({
                    "status": "Pending",
                    "currentTime": now,
                    "interval": behavior.retry_interval
                })
            } else {
                let interval = match behavior.boot_reply {
                    BootReply::Accepted => behavior.heartbeat_interval,
                    BootReply::Rejected => behavior.retry_interval,
                };
                json!({
                    "status": behavior.boot_reply.as_str(),
                    "currentTime": now,
                    "interval": interval
                })
            }
        }
        "Heartbeat" => json!({ "currentTime": now }),
        "Authorize" => json!({ "idTagInfo": { "status": behavior.status_for(id_tag) } }),
        "StartTransaction" => {
            let transaction_id = shared.next_transaction_id.fetch_add(1, Ordering::AcqRel);
            json!({
                "idTagInfo": { "status": behavior.status_for(id_tag) },
                "transactionId": transaction_id,
            })
        }
        "StopTransaction" => json!({ "idTagInfo": { "status": "Accepted" } }),
        "MeterValues" | "StatusNotification" => json!({}),
        other => {
            return Some(Err((
                "NotImplemented".to_string(),
                format!("{} not implemented by fake Central System", other),
            )))
        }
    };
    Some(Ok(reply))
}
