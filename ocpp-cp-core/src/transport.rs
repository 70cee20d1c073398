//! WebSocket transport to the Central System
//!
//! One pump task owns the socket: it drains the outbound queue into the
//! sink and pushes inbound text frames onto a channel. The pump is the
//! only reader of the socket. When either direction fails the pump ends,
//! the inbound channel closes and `recv` returns `None`.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{CentralSystemEndpoint, TransportConfig};
use crate::error::{ConnectError, SendError};

/// OCPP 1.6 JSON WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Open connection to the Central System
pub struct Transport {
    url: String,
    outgoing: mpsc::Sender<String>,
    incoming: mpsc::Receiver<String>,
    pump: JoinHandle<()>,
}

impl Transport {
    /// Resolve, connect and complete the WebSocket handshake within
    /// `config.connect_timeout`.
    pub async fn connect(
        endpoint: &CentralSystemEndpoint,
        charge_point_id: &str,
        config: &TransportConfig,
    ) -> Result<Self, ConnectError> {
        let url = endpoint.url(charge_point_id);
        let ws = tokio::time::timeout(config.connect_timeout, handshake(endpoint, &url, config))
            .await
            .map_err(|_| ConnectError::Timeout(config.connect_timeout))??;

        info!("WebSocket connected to {}", url);

        let (outgoing, outgoing_rx) = mpsc::channel(config.send_queue.max(1));
        let (incoming_tx, incoming) = mpsc::channel(config.send_queue.max(1));
        let pump = tokio::spawn(pump(ws, outgoing_rx, incoming_tx));

        Ok(Self {
            url,
            outgoing,
            incoming,
            pump,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue a text frame for sending
    pub async fn send(&self, text: String) -> Result<(), SendError> {
        self.outgoing.send(text).await.map_err(|_| SendError::Closed)
    }

    /// Sender half for other tasks
    pub fn sender(&self) -> mpsc::Sender<String> {
        self.outgoing.clone()
    }

    /// Next inbound text frame; `None` once the connection is gone
    pub async fn recv(&mut self) -> Option<String> {
        self.incoming.recv().await
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn handshake(
    endpoint: &CentralSystemEndpoint,
    url: &str,
    config: &TransportConfig,
) -> Result<WebSocketStream<TcpStream>, ConnectError> {
    let stream = open_tcp(endpoint).await?;

    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectError::InvalidUrl(format!("{}: {}", url, e)))?;
    request.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(OCPP_SUBPROTOCOL),
    );

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_frame_size),
        ..Default::default()
    };

    let (ws, response) = client_async_with_config(request, stream, Some(ws_config))
        .await
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(OCPP_SUBPROTOCOL) {
        warn!(
            "Central System did not accept OCPP 1.6 subprotocol, got: {:?}",
            accepted
        );
    }

    Ok(ws)
}

/// Resolve the host and connect to the first reachable address of the
/// configured family
async fn open_tcp(endpoint: &CentralSystemEndpoint) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.bare_host(), endpoint.port))
        .await
        .map_err(|source| ConnectError::Resolve {
            host: endpoint.host.clone(),
            source,
        })?
        .filter(|addr| endpoint.address_family.accepts(addr))
        .collect();

    let mut last_error = None;
    for addr in &addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                return Ok(stream);
            }
            Err(source) => {
                debug!("Connect to {} failed: {}", addr, source);
                last_error = Some((*addr, source));
            }
        }
    }

    match last_error {
        Some((addr, source)) => Err(ConnectError::Refused {
            addr: addr.to_string(),
            source,
        }),
        None => Err(ConnectError::NoAddress {
            host: endpoint.host.clone(),
            family: endpoint.address_family.to_string(),
        }),
    }
}

async fn pump(
    ws: WebSocketStream<TcpStream>,
    mut outgoing: mpsc::Receiver<String>,
    incoming: mpsc::Sender<String>,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            msg = outgoing.recv() => {
                let Some(text) = msg else {
                    // Transport dropped
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                debug!("Sending: {}", text);
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received: {}", text);
                        if incoming.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Central System closed the connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }
}
