//! Central System link controller
//!
//! Connect, register with BootNotification, keep the link alive with
//! Heartbeat, and reconnect with exponential backoff when it drops. A
//! rejected BootNotification is fatal and stops the controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::EngineCore;
use crate::error::{CallError, EngineError};
use crate::events::EngineEvent;
use crate::ocpp::{
    BootNotificationRequest, ChargePointErrorCode, ChargePointStatus, HeartbeatRequest,
    RegistrationStatus, StatusNotificationRequest,
};
use crate::transport::Transport;

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `link_down` for its epoch when the connection scope ends
struct LinkGuard {
    core: Arc<EngineCore>,
    epoch: u64,
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        self.core.link_down(self.epoch);
    }
}

pub(crate) struct Controller {
    core: Arc<EngineCore>,
}

impl Controller {
    pub(crate) fn new(core: Arc<EngineCore>) -> Self {
        Self { core }
    }

    /// Connection loop; ends on `stop` or on a rejected BootNotification
    pub(crate) async fn run(self, mut stop: oneshot::Receiver<()>) -> Result<(), EngineError> {
        let config = &self.core.config;
        let mut reconnect_delay = config.reconnect_delay;

        loop {
            let outcome = tokio::select! {
                outcome = self.connect_and_run() => outcome,
                _ = &mut stop => {
                    info!("Controller stopped");
                    return Ok(());
                }
            };

            match outcome {
                Ok(()) => {
                    info!("Connection to Central System closed");
                    reconnect_delay = config.reconnect_delay;
                }
                Err(EngineError::BootRejected) => {
                    error!("Central System rejected BootNotification, not reconnecting");
                    self.core.events.publish(EngineEvent::BootRejected);
                    return Err(EngineError::BootRejected);
                }
                Err(e) => error!("Connection error: {}", e),
            }

            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::select! {
                _ = tokio::time::sleep(reconnect_delay) => {}
                _ = &mut stop => {
                    info!("Controller stopped");
                    return Ok(());
                }
            }
            reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
        }
    }

    /// One connection: returns Ok once a registered link is lost
    async fn connect_and_run(&self) -> Result<(), EngineError> {
        let config = &self.core.config;
        let charge_point_id = config.identity.charge_point_id();
        info!(
            "Connecting to Central System: {}",
            config.endpoint.url(charge_point_id)
        );

        let mut transport =
            Transport::connect(&config.endpoint, charge_point_id, &config.transport).await?;
        let epoch = self.core.correlator.attach(transport.sender());
        self.core.events.publish(EngineEvent::Connected);

        let core = self.core.clone();
        let mut receiver = AbortOnDrop(tokio::spawn(async move {
            while let Some(text) = transport.recv().await {
                core.correlator.handle_frame(&text).await;
            }
            core.link_down(epoch);
        }));
        let _link = LinkGuard {
            core: self.core.clone(),
            epoch,
        };

        let heartbeat_interval = self.boot().await?;
        self.core.correlator.set_registered(true);
        info!(?heartbeat_interval, "Registered with Central System");
        self.core.events.publish(EngineEvent::BootAccepted { heartbeat_interval });

        let mut ticker =
            tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut receiver.0 => {
                    warn!("Connection to Central System lost");
                    return Ok(());
                }
                _ = ticker.tick() => self.heartbeat().await,
            }
        }
    }

    /// BootNotification until Accepted; Pending waits and resends
    async fn boot(&self) -> Result<Duration, EngineError> {
        let config = &self.core.config;
        let identity = &config.identity;
        let request = BootNotificationRequest {
            charge_point_vendor: identity.vendor.clone(),
            charge_point_model: identity.model.clone(),
            charge_point_serial_number: identity.serial_number.clone(),
            firmware_version: identity.firmware_version.clone(),
            meter_type: identity.meter_type.clone(),
        };

        loop {
            let response = match self.core.correlator.send(&request, config.call_timeout).await {
                Ok(response) => response,
                Err(e @ CallError::Timeout { .. }) => {
                    warn!("{}, retrying in {:?}", e, config.boot_retry_interval);
                    tokio::time::sleep(config.boot_retry_interval).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let interval = positive_secs(response.interval);
            match response.status {
                RegistrationStatus::Accepted => {
                    return Ok(interval.unwrap_or(config.heartbeat_interval));
                }
                RegistrationStatus::Pending => {
                    let wait = interval.unwrap_or(config.boot_retry_interval);
                    info!("BootNotification pending, retrying in {:?}", wait);
                    tokio::time::sleep(wait).await;
                }
                RegistrationStatus::Rejected => return Err(EngineError::BootRejected),
            }
        }
    }

    async fn heartbeat(&self) {
        match self
            .core
            .correlator
            .send(&HeartbeatRequest {}, self.core.config.call_timeout)
            .await
        {
            Ok(response) => debug!("Heartbeat acknowledged at {}", response.current_time),
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}

fn positive_secs(seconds: i32) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds as u64))
}

/// Sends StatusNotification for every connector state change, and for all
/// connectors after each accepted boot
pub(crate) async fn report_status(
    core: Arc<EngineCore>,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    let mut reported: HashMap<u32, ChargePointStatus> = HashMap::new();

    loop {
        match events.recv().await {
            Ok(EngineEvent::BootAccepted { .. }) => {
                reported.clear();
                send_status(&core, 0, ChargePointStatus::Available).await;
                for connector_id in core.sessions.connector_ids() {
                    let state = core.sessions.state(connector_id).unwrap_or_default();
                    if send_status(&core, connector_id, state.status()).await {
                        reported.insert(connector_id, state.status());
                    }
                }
            }
            Ok(EngineEvent::StateChanged { connector_id, to, .. }) => {
                let status = to.status();
                let unchanged = reported.get(&connector_id) == Some(&status);
                if !core.correlator.is_registered() || unchanged {
                    continue;
                }
                if send_status(&core, connector_id, status).await {
                    reported.insert(connector_id, status);
                }
            }
            Ok(EngineEvent::TransportLost) => reported.clear(),
            Ok(EngineEvent::Shutdown) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Status reporter lagged behind events");
                reported.clear();
            }
        }
    }
}

async fn send_status(core: &EngineCore, connector_id: u32, status: ChargePointStatus) -> bool {
    let error_code = if status == ChargePointStatus::Faulted {
        ChargePointErrorCode::OtherError
    } else {
        ChargePointErrorCode::NoError
    };
    let request = StatusNotificationRequest {
        connector_id,
        error_code,
        status,
        timestamp: Some(Utc::now()),
    };
    match core.correlator.send(&request, core.config.call_timeout).await {
        Ok(_) => true,
        Err(e) => {
            warn!(connector_id, ?status, "StatusNotification failed: {}", e);
            false
        }
    }
}
