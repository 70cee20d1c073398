//! Connector worker
//!
//! One task per connector. It takes over the session claimed for a
//! presented credential, authorizes, starts a transaction, samples the
//! meter while charging and stops the transaction when asked to, when a
//! charge limit is hit, or after the link to the Central System comes back
//! from a transport loss.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::EngineCore;
use crate::events::{CredentialOrigin, EngineEvent};
use crate::meter::{self, MeterReading, Notify};
use crate::ocpp::{Measurand, MeterValuesRequest, Reason, ReadingContext};
use crate::session::{SessionHandle, SessionState};

/// What the worker does after a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Why charging ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChargingEnd {
    Stop(Reason),
    TransportLost,
    Shutdown,
}

pub(crate) struct ConnectorWorker {
    connector_id: u32,
    core: Arc<EngineCore>,
}

impl ConnectorWorker {
    pub(crate) fn new(connector_id: u32, core: Arc<EngineCore>) -> Self {
        Self { connector_id, core }
    }

    pub(crate) async fn run(self, mut events: broadcast::Receiver<EngineEvent>) {
        debug!(connector_id = self.connector_id, "Connector worker started");
        while let Some((handle, id_tag, origin)) = self.wait_for_credential(&mut events).await {
            if self.run_session(handle, &mut events, &id_tag, origin).await == Flow::Shutdown {
                break;
            }
        }
        debug!(connector_id = self.connector_id, "Connector worker stopped");
    }

    fn is_mine(&self, connector_id: u32) -> bool {
        connector_id == self.connector_id
    }

    /// Idle loop. Commands for a session the application drives itself are
    /// forwarded to the application.
    async fn wait_for_credential(
        &self,
        events: &mut broadcast::Receiver<EngineEvent>,
    ) -> Option<(SessionHandle, String, CredentialOrigin)> {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Credential {
                    connector_id,
                    id_tag,
                    origin,
                    handle,
                }) if self.is_mine(connector_id) => return Some((handle, id_tag, origin)),
                Ok(EngineEvent::StopRequested {
                    connector_id,
                    reason,
                }) if self.is_mine(connector_id) && reason != Reason::Local => {
                    self.forward_stop(reason).await;
                }
                Ok(EngineEvent::Unlock { connector_id }) if self.is_mine(connector_id) => {
                    self.notify(Notify::UnlockConnector { connector_id }).await;
                }
                Ok(EngineEvent::Shutdown) | Err(RecvError::Closed) => return None,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connector_id = self.connector_id, skipped, "Worker lagged behind events");
                }
            }
        }
    }

    /// Stop request for a transaction started through the session API
    async fn forward_stop(&self, reason: Reason) {
        let connector_id = self.connector_id;
        let transaction_id = match self.core.sessions.snapshot(connector_id) {
            Ok(snapshot) => snapshot.transaction_id,
            Err(e) => {
                warn!(connector_id, "Cannot read session: {}", e);
                return;
            }
        };
        let Some(transaction_id) = transaction_id else {
            debug!(connector_id, ?reason, "Stop request without a transaction");
            return;
        };
        info!(connector_id, transaction_id, ?reason, "Asking application to stop charging");
        self.notify(Notify::StopCharging {
            connector_id,
            transaction_id: Some(transaction_id),
        })
        .await;
    }

    async fn run_session(
        &self,
        handle: SessionHandle,
        events: &mut broadcast::Receiver<EngineEvent>,
        id_tag: &str,
        origin: CredentialOrigin,
    ) -> Flow {
        let flow = self.drive(&handle, events, id_tag, origin).await;

        if let Err(e) = self.core.sessions.close(handle) {
            warn!(connector_id = self.connector_id, "Failed to close session: {}", e);
        }
        flow
    }

    async fn drive(
        &self,
        handle: &SessionHandle,
        events: &mut broadcast::Receiver<EngineEvent>,
        id_tag: &str,
        origin: CredentialOrigin,
    ) -> Flow {
        let connector_id = self.connector_id;
        let timeout = self.core.config.call_timeout;

        if let Err(e) = self.core.sessions.prepare(handle, id_tag) {
            warn!(connector_id, "Cannot prepare session: {}", e);
            return Flow::Continue;
        }

        match self.core.authorize(handle, id_tag, timeout).await {
            Ok(status) if status.is_accepted() => {}
            Ok(status) => {
                info!(connector_id, id_tag, ?status, "Credential not accepted");
                return Flow::Continue;
            }
            Err(e) => {
                warn!(connector_id, "Authorization failed: {}", e);
                return Flow::Continue;
            }
        }

        let meter_start = self.read_energy().await.unwrap_or(0);
        let transaction_id = match self
            .core
            .start_transaction(handle, meter_start, connector_id, timeout)
            .await
        {
            Ok(transaction_id) => transaction_id,
            Err(e) => {
                warn!(connector_id, "Transaction not started: {}", e);
                return Flow::Continue;
            }
        };

        if origin == CredentialOrigin::Remote {
            self.notify(Notify::StartCharging {
                connector_id,
                id_tag: id_tag.to_string(),
            })
            .await;
        }

        let end = self.charge(events, transaction_id, meter_start).await;
        if end != ChargingEnd::Stop(Reason::Local) {
            self.notify(Notify::StopCharging {
                connector_id,
                transaction_id: Some(transaction_id),
            })
            .await;
        }

        let flow = self.settle(handle, events, transaction_id, end).await;

        if end == ChargingEnd::Stop(Reason::UnlockCommand) {
            self.notify(Notify::UnlockConnector { connector_id }).await;
        }
        flow
    }

    /// Charging loop; returns on the first stop condition
    async fn charge(
        &self,
        events: &mut broadcast::Receiver<EngineEvent>,
        transaction_id: i32,
        meter_start: i32,
    ) -> ChargingEnd {
        let connector_id = self.connector_id;
        let interval = self.core.config.meter.interval;
        let limits = &self.core.config.limits;

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let duration_limit = sleep_until(limits.duration.map(|d| Instant::now() + d));
        tokio::pin!(duration_limit);

        loop {
            tokio::select! {
                _ = &mut duration_limit => {
                    info!(connector_id, transaction_id, "Charge duration limit reached");
                    return ChargingEnd::Stop(Reason::Other);
                }
                _ = ticker.tick() => {
                    let readings = meter::sample_blocking(
                        &self.core.meter,
                        connector_id,
                        &self.core.config.meter.measurands,
                    )
                    .await;
                    self.report_meter(transaction_id, &readings).await;

                    if self.energy_limit_reached(&readings, meter_start).await {
                        info!(connector_id, transaction_id, "Charge energy limit reached");
                        return ChargingEnd::Stop(Reason::Other);
                    }
                }
                event = events.recv() => match event {
                    Ok(EngineEvent::StopRequested { connector_id, reason })
                        if self.is_mine(connector_id) =>
                    {
                        return ChargingEnd::Stop(reason);
                    }
                    Ok(EngineEvent::Unlock { connector_id }) if self.is_mine(connector_id) => {
                        return ChargingEnd::Stop(Reason::UnlockCommand);
                    }
                    Ok(EngineEvent::TransportLost) => {
                        if self.core.sessions.state(connector_id) == Ok(SessionState::Faulted) {
                            return ChargingEnd::TransportLost;
                        }
                    }
                    Ok(EngineEvent::Shutdown) | Err(RecvError::Closed) => {
                        return ChargingEnd::Shutdown;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(connector_id, skipped, "Worker lagged behind events");
                    }
                },
            }
        }
    }

    /// Bring the session back to Idle, reporting the stop once the link allows
    async fn settle(
        &self,
        handle: &SessionHandle,
        events: &mut broadcast::Receiver<EngineEvent>,
        transaction_id: i32,
        mut end: ChargingEnd,
    ) -> Flow {
        loop {
            match end {
                ChargingEnd::Stop(reason) => {
                    if self.finish(handle, reason).await {
                        return Flow::Continue;
                    }
                    end = ChargingEnd::TransportLost;
                }
                ChargingEnd::TransportLost => {
                    warn!(
                        connector_id = self.connector_id,
                        transaction_id, "Transaction interrupted, waiting for Central System"
                    );
                    if !self.wait_for_boot(events).await {
                        return Flow::Shutdown;
                    }
                    end = ChargingEnd::Stop(Reason::PowerLoss);
                }
                ChargingEnd::Shutdown => {
                    self.finish(handle, Reason::Other).await;
                    return Flow::Shutdown;
                }
            }
        }
    }

    /// StopTransaction; false if the session was faulted meanwhile and the
    /// stop has to be replayed after reconnect
    async fn finish(&self, handle: &SessionHandle, reason: Reason) -> bool {
        let meter_stop = match self.read_energy().await {
            Some(wh) => wh,
            None => self
                .core
                .sessions
                .snapshot(self.connector_id)
                .ok()
                .and_then(|s| s.meter_start)
                .unwrap_or(0),
        };

        match self
            .core
            .stop_transaction(handle, meter_stop, reason, self.core.config.call_timeout)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                if self.core.sessions.state(self.connector_id) == Ok(SessionState::Faulted) {
                    return false;
                }
                warn!(connector_id = self.connector_id, "Failed to stop transaction: {}", e);
                true
            }
        }
    }

    /// Wait for the next accepted boot; false on shutdown
    async fn wait_for_boot(&self, events: &mut broadcast::Receiver<EngineEvent>) -> bool {
        loop {
            match events.recv().await {
                Ok(EngineEvent::BootAccepted { .. }) => return true,
                Ok(EngineEvent::Shutdown) | Err(RecvError::Closed) => return false,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    if self.core.correlator.is_registered() {
                        return true;
                    }
                }
            }
        }
    }

    async fn report_meter(&self, transaction_id: i32, readings: &[MeterReading]) {
        if readings.is_empty() {
            return;
        }
        let request = MeterValuesRequest {
            connector_id: self.connector_id,
            transaction_id: Some(transaction_id),
            meter_value: vec![meter::meter_value(readings, ReadingContext::SamplePeriodic)],
        };
        if let Err(e) = self
            .core
            .correlator
            .send(&request, self.core.config.call_timeout)
            .await
        {
            warn!(connector_id = self.connector_id, "MeterValues failed: {}", e);
        }
    }

    async fn energy_limit_reached(&self, readings: &[MeterReading], meter_start: i32) -> bool {
        let Some(limit) = self.core.config.limits.energy_wh else {
            return false;
        };
        let energy = match readings.iter().find_map(MeterReading::as_wh) {
            Some(wh) => Some(wh),
            None => self.read_energy().await,
        };
        energy.is_some_and(|wh| wh.saturating_sub(meter_start) >= limit)
    }

    /// Energy register in Wh
    async fn read_energy(&self) -> Option<i32> {
        match meter::read_blocking(
            &self.core.meter,
            self.connector_id,
            Measurand::EnergyActiveImportRegister,
        )
        .await
        {
            Ok(reading) => reading.as_wh(),
            Err(e) => {
                warn!(connector_id = self.connector_id, "Energy register read failed: {}", e);
                None
            }
        }
    }

    async fn notify(&self, event: Notify) {
        if let Err(e) = meter::notify_app(&self.core.notify, event).await {
            warn!(connector_id = self.connector_id, "{}", e);
        }
    }
}

/// Resolves at `deadline`, or never
fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
