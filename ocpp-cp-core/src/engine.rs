//! Public charge point API
//!
//! `ChargePoint::init` builds the shared engine state and starts the
//! controller, one worker per connector and the status reporter. Session
//! level calls (`authorize`, `start_transaction`, `stop_transaction`) are
//! shared by the application and the connector workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::connector::ConnectorWorker;
use crate::controller::{self, Controller};
use crate::dispatcher::CommandDispatcher;
use crate::error::{CallError, EngineError, SessionError};
use crate::events::{CredentialOrigin, EngineEvent, EventBus};
use crate::meter::{MeterProvider, NotifyCallback, NotifyMeterProvider};
use crate::ocpp::{
    Action, AuthorizationStatus, AuthorizeRequest, Reason, StartTransactionRequest,
    StopTransactionRequest,
};
use crate::retry::retry_with_backoff;
use crate::rpc::Correlator;
use crate::session::{
    SessionHandle, SessionSnapshot, SessionState, SessionTable, TransactionSummary,
};

/// State shared by every engine task
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) sessions: Arc<SessionTable>,
    pub(crate) events: EventBus,
    pub(crate) notify: NotifyCallback,
    pub(crate) meter: Arc<dyn MeterProvider>,
}

impl EngineCore {
    /// Connection `epoch` is gone: fault active sessions, fail pending calls
    pub(crate) fn link_down(&self, epoch: u64) {
        if !self.correlator.is_current(epoch) {
            return;
        }
        let faulted = self.sessions.fault_active();
        if !faulted.is_empty() {
            warn!(?faulted, "Connectors faulted by transport loss");
        }
        self.correlator.detach_epoch(epoch);
        self.events.publish(EngineEvent::TransportLost);
    }

    /// Idle -> Preparing -> Authorizing, then Authorize with retry
    pub(crate) async fn authorize(
        &self,
        handle: &SessionHandle,
        id_tag: &str,
        timeout: Duration,
    ) -> Result<AuthorizationStatus, EngineError> {
        self.sessions.prepare(handle, id_tag)?;
        self.sessions.begin_authorize(handle)?;

        let request = AuthorizeRequest {
            id_tag: id_tag.to_string(),
        };
        let result = retry_with_backoff(
            &self.config.authorize_retry,
            |_| self.correlator.send(&request, timeout),
            CallError::is_transient,
            "Authorize",
        )
        .await;

        match result {
            Ok(response) => {
                let status = response.id_tag_info.status;
                info!(
                    connector_id = handle.connector_id(),
                    id_tag,
                    ?status,
                    "Authorization answered"
                );
                self.sessions.finish_authorize(handle, status)?;
                Ok(status)
            }
            Err(e) => {
                self.sessions.release(handle)?;
                Err(e.into())
            }
        }
    }

    /// StartTransaction for an authorized session; returns the transaction id
    pub(crate) async fn start_transaction(
        &self,
        handle: &SessionHandle,
        meter_start: i32,
        connector_id: u32,
        timeout: Duration,
    ) -> Result<i32, EngineError> {
        if handle.connector_id() != connector_id {
            return Err(SessionError::ConnectorMismatch {
                handle: handle.connector_id(),
                requested: connector_id,
            }
            .into());
        }
        let id_tag = self.sessions.begin_start(handle)?;

        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.clone(),
            meter_start,
            timestamp: Utc::now(),
            reservation_id: None,
        };
        let response = match self.correlator.send(&request, timeout).await {
            Ok(response) => response,
            Err(e) => {
                self.sessions.release(handle)?;
                return Err(e.into());
            }
        };

        let status = response.id_tag_info.status;
        if !status.is_accepted() {
            warn!(
                connector_id,
                transaction_id = response.transaction_id,
                ?status,
                "Transaction start refused, stopping"
            );
            let stop = StopTransactionRequest {
                id_tag: Some(id_tag),
                meter_stop: meter_start,
                timestamp: Utc::now(),
                transaction_id: response.transaction_id,
                reason: Some(Reason::DeAuthorized),
            };
            if let Err(e) = self.correlator.send(&stop, timeout).await {
                warn!(connector_id, "StopTransaction after refused start failed: {}", e);
            }
            self.sessions.release(handle)?;
            return Err(EngineError::StartRefused(status));
        }

        self.sessions
            .confirm_start(handle, response.transaction_id, meter_start)?;
        info!(
            connector_id,
            transaction_id = response.transaction_id,
            meter_start,
            "Transaction started"
        );
        self.events.publish(EngineEvent::TransactionStarted {
            connector_id,
            transaction_id: response.transaction_id,
        });
        Ok(response.transaction_id)
    }

    /// StopTransaction; a failed call is logged and the session still ends
    pub(crate) async fn stop_transaction(
        &self,
        handle: &SessionHandle,
        meter_stop: i32,
        reason: Reason,
        timeout: Duration,
    ) -> Result<TransactionSummary, EngineError> {
        let pending = self.sessions.begin_stop(handle)?;
        let request = StopTransactionRequest {
            id_tag: pending.id_tag.clone(),
            meter_stop,
            timestamp: Utc::now(),
            transaction_id: pending.transaction_id,
            reason: Some(reason),
        };

        let reported = match self.correlator.send(&request, timeout).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    connector_id = handle.connector_id(),
                    transaction_id = pending.transaction_id,
                    "StopTransaction failed: {}",
                    e
                );
                false
            }
        };

        let mut summary = self.sessions.finish_stop(handle, meter_stop)?;
        summary.reported = reported;
        info!(
            connector_id = summary.connector_id,
            transaction_id = summary.transaction_id,
            energy_wh = summary.energy_wh,
            ?reason,
            "Transaction stopped"
        );
        self.events.publish(EngineEvent::TransactionStopped {
            connector_id: summary.connector_id,
            summary: summary.clone(),
        });
        Ok(summary)
    }
}

/// Running charge point engine
pub struct ChargePoint {
    core: Arc<EngineCore>,
    controller: Mutex<Option<(oneshot::Sender<()>, JoinHandle<Result<(), EngineError>>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChargePoint {
    /// Validate `config` and start the engine; must run inside a tokio runtime
    pub fn init(config: EngineConfig, notify: NotifyCallback) -> Result<Self, EngineError> {
        let meter: Arc<dyn MeterProvider> = Arc::new(NotifyMeterProvider::new(notify.clone()));
        Self::with_meter(config, notify, meter)
    }

    /// Like `init`, with a dedicated meter source
    pub fn with_meter(
        config: EngineConfig,
        notify: NotifyCallback,
        meter: Arc<dyn MeterProvider>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(EngineError::NoRuntime);
        }

        let events = EventBus::new(config.event_capacity);
        let sessions = Arc::new(SessionTable::new(
            config.identity.connector_count,
            events.clone(),
        ));
        let correlator = Arc::new(Correlator::new());
        correlator.set_handler(Arc::new(CommandDispatcher::new(
            sessions.clone(),
            events.clone(),
        )));

        let core = Arc::new(EngineCore {
            config,
            correlator,
            sessions,
            events,
            notify,
            meter,
        });

        info!(
            charge_point_id = core.config.identity.charge_point_id(),
            connectors = core.sessions.len(),
            "Starting charge point engine"
        );

        let mut tasks = Vec::new();
        for connector_id in core.sessions.connector_ids() {
            let worker = ConnectorWorker::new(connector_id, core.clone());
            tasks.push(tokio::spawn(worker.run(core.events.subscribe())));
        }
        tasks.push(tokio::spawn(controller::report_status(
            core.clone(),
            core.events.subscribe(),
        )));

        let (stop_tx, stop_rx) = oneshot::channel();
        let controller = tokio::spawn(Controller::new(core.clone()).run(stop_rx));

        Ok(Self {
            core,
            controller: Mutex::new(Some((stop_tx, controller))),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Claim a connector for direct session control
    pub fn session_open(&self, connector_id: u32) -> Result<SessionHandle, EngineError> {
        Ok(self.core.sessions.open(connector_id)?)
    }

    pub fn session_close(&self, handle: SessionHandle) -> Result<(), EngineError> {
        Ok(self.core.sessions.close(handle)?)
    }

    pub async fn authorize(
        &self,
        handle: &SessionHandle,
        id_tag: &str,
        timeout: Duration,
    ) -> Result<AuthorizationStatus, EngineError> {
        self.core.authorize(handle, id_tag, timeout).await
    }

    pub async fn start_transaction(
        &self,
        handle: &SessionHandle,
        meter_start: i32,
        connector_id: u32,
        timeout: Duration,
    ) -> Result<i32, EngineError> {
        self.core
            .start_transaction(handle, meter_start, connector_id, timeout)
            .await
    }

    pub async fn stop_transaction(
        &self,
        handle: &SessionHandle,
        meter_stop: i32,
        timeout: Duration,
    ) -> Result<TransactionSummary, EngineError> {
        self.core
            .stop_transaction(handle, meter_stop, Reason::Local, timeout)
            .await
    }

    /// Claim the connector and hand the credential to its worker
    pub fn present_credential(&self, connector_id: u32, id_tag: &str) -> Result<(), EngineError> {
        let handle = self.core.sessions.open(connector_id)?;
        self.core.events.publish(EngineEvent::Credential {
            connector_id,
            id_tag: id_tag.to_string(),
            origin: CredentialOrigin::Local,
            handle,
        });
        Ok(())
    }

    /// Ask the connector's worker to stop charging
    pub fn request_stop(&self, connector_id: u32) -> Result<(), EngineError> {
        self.core.sessions.state(connector_id)?;
        self.core.events.publish(EngineEvent::StopRequested {
            connector_id,
            reason: Reason::Local,
        });
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.core.events.subscribe()
    }

    pub fn session_state(&self, connector_id: u32) -> Result<SessionState, EngineError> {
        Ok(self.core.sessions.state(connector_id)?)
    }

    pub fn session_snapshot(&self, connector_id: u32) -> Result<SessionSnapshot, EngineError> {
        Ok(self.core.sessions.snapshot(connector_id)?)
    }

    /// Calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.core.correlator.pending_len()
    }

    pub fn is_registered(&self) -> bool {
        self.core.correlator.is_registered()
    }

    /// Wait until BootNotification is accepted. Running out of time is a
    /// `CallError::Timeout` for BootNotification.
    pub async fn wait_registered(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut events = self.core.events.subscribe();
        if self.is_registered() {
            return Ok(());
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::BootAccepted { .. }) => return Ok(()),
                    Ok(EngineEvent::BootRejected) => return Err(EngineError::BootRejected),
                    Ok(EngineEvent::Shutdown) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(EngineError::Shutdown)
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_registered() {
                            return Ok(());
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            EngineError::Call(CallError::Timeout {
                action: Action::BootNotification,
                after: timeout,
            })
        })?
    }

    /// Stop workers (sending StopTransaction for running transactions),
    /// then the controller. Returns how the controller ended.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        info!("Shutting down charge point engine");
        self.core.events.publish(EngineEvent::Shutdown);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Engine task ended abnormally: {}", e);
            }
        }

        let controller = self.controller.lock().take();
        match controller {
            Some((stop, handle)) => {
                let _ = stop.send(());
                match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!("Controller ended abnormally: {}", e);
                        Ok(())
                    }
                }
            }
            None => Err(EngineError::Shutdown),
        }
    }
}

impl Drop for ChargePoint {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some((_, handle)) = self.controller.lock().take() {
            handle.abort();
        }
    }
}
