//! End-to-end scenarios against the fake Central System
//!
//! Each test runs a real engine over a loopback WebSocket with short
//! intervals, so they take a few hundred milliseconds to a few seconds.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ocpp_cp_core::{
    Action, AuthorizationStatus, CallError, CentralSystemEndpoint, ChargeLimits, ChargePoint,
    ChargePointIdentity, EngineConfig, EngineError, EngineEvent, Measurand, Notify,
    NotifyCallback, NotifyReply, RetryPolicy, SessionError, SessionState,
};
use ocpp_cs_harness::{CsBehavior, FakeCentralSystem, RecordedCall};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(5);
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Application side: an energy register and a log of notify calls
#[derive(Clone)]
struct App {
    energy_wh: Arc<AtomicI32>,
    notified: Arc<Mutex<Vec<Notify>>>,
}

impl App {
    fn new(energy_wh: i32) -> Self {
        Self {
            energy_wh: Arc::new(AtomicI32::new(energy_wh)),
            notified: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn callback(&self) -> NotifyCallback {
        let app = self.clone();
        Arc::new(move |notify: Notify| match notify {
            Notify::GetMeterValue {
                measurand: Measurand::EnergyActiveImportRegister,
                ..
            } => Ok(NotifyReply::Reading(
                app.energy_wh.load(Ordering::SeqCst).to_string(),
            )),
            Notify::GetMeterValue { .. } => Ok(NotifyReply::Reading("7400".to_string())),
            other => {
                app.notified.lock().push(other);
                Ok(NotifyReply::Ack)
            }
        })
    }

    fn set_energy(&self, wh: i32) {
        self.energy_wh.store(wh, Ordering::SeqCst);
    }

    fn notified(&self) -> Vec<Notify> {
        self.notified.lock().clone()
    }

    async fn wait_notified(&self, expected: Notify) {
        let deadline = Instant::now() + WAIT;
        while !self.notified().contains(&expected) {
            assert!(Instant::now() < deadline, "never notified {:?}", expected);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn config(port: u16, connectors: u32) -> EngineConfig {
    EngineConfig::new(
        ChargePointIdentity::new("Elektrokombinacija", "EK3")
            .with_serial("EK3-0001")
            .with_connectors(connectors),
        CentralSystemEndpoint::new("127.0.0.1", port, "ocpp"),
    )
    .with_call_timeout(CALL_TIMEOUT)
    .with_reconnect_delay(Duration::from_millis(100), Duration::from_millis(400))
    .with_authorize_retry(RetryPolicy::none())
    .with_meter_interval(Duration::from_millis(200))
}

async fn start(
    behavior: CsBehavior,
    connectors: u32,
    app: &App,
) -> (FakeCentralSystem, ChargePoint) {
    let cs = FakeCentralSystem::start(behavior).await.unwrap();
    let cp = ChargePoint::init(config(cs.port(), connectors), app.callback()).unwrap();
    (cs, cp)
}

async fn wait_event(
    events: &mut broadcast::Receiver<EngineEvent>,
    matches: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published in time")
}

async fn wait_started(events: &mut broadcast::Receiver<EngineEvent>, connector: u32) -> i32 {
    match wait_event(events, |e| {
        matches!(
            e,
            EngineEvent::TransactionStarted { connector_id, .. } if *connector_id == connector
        )
    })
    .await
    {
        EngineEvent::TransactionStarted { transaction_id, .. } => transaction_id,
        other => panic!("unexpected event {:?}", other),
    }
}

async fn wait_state(cp: &ChargePoint, connector_id: u32, state: SessionState) {
    let deadline = Instant::now() + WAIT;
    while cp.session_state(connector_id).unwrap() != state {
        assert!(
            Instant::now() < deadline,
            "connector {} never reached {:?}",
            connector_id,
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn stop_call(cs: &FakeCentralSystem, transaction_id: i32) -> RecordedCall {
    cs.wait_for_call_matching(
        "StopTransaction",
        |p| p["transactionId"] == transaction_id,
        WAIT,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_boot_heartbeat_and_initial_status() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting().with_heartbeat_interval(1), 2, &app).await;

    cp.wait_registered(WAIT).await.unwrap();
    assert!(cp.is_registered());

    let boot = &cs.calls_for("BootNotification")[0];
    assert_eq!(boot.payload["chargePointVendor"], "Elektrokombinacija");
    assert_eq!(boot.payload["chargePointModel"], "EK3");
    assert_eq!(boot.payload["chargePointSerialNumber"], "EK3-0001");
    assert_eq!(cs.request_paths(), vec!["/ocpp/EK3-0001".to_string()]);
    assert_eq!(cs.offered_subprotocols(), vec![Some("ocpp1.6".to_string())]);

    let statuses = cs.wait_for_calls("StatusNotification", 3, WAIT).await.unwrap();
    let mut connectors: Vec<_> = statuses
        .iter()
        .map(|c| c.payload["connectorId"].as_u64().unwrap())
        .collect();
    connectors.sort_unstable();
    assert_eq!(connectors, vec![0, 1, 2]);
    assert!(statuses
        .iter()
        .all(|c| c.payload["status"] == "Available" && c.payload["errorCode"] == "NoError"));

    // interval comes from the BootNotification answer, not the local default
    let beats = cs.wait_for_calls("Heartbeat", 2, WAIT).await.unwrap();
    let gap = beats[1].received_at - beats[0].received_at;
    assert!(gap >= Duration::from_millis(900), "heartbeat gap {:?}", gap);

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pending_boot_is_retried() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::pending(1), 1, &app).await;

    cp.wait_registered(WAIT).await.unwrap();

    let boots = cs.calls_for("BootNotification");
    assert_eq!(boots.len(), 2);
    assert!(boots[1].received_at - boots[0].received_at >= Duration::from_millis(900));
    assert_eq!(cs.connection_count(), 1);

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_boot_is_fatal() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::rejecting(), 1, &app).await;

    let result = cp.wait_registered(WAIT).await;
    assert!(matches!(result, Err(EngineError::BootRejected)), "{:?}", result);

    // no reconnect attempts after a rejection
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cs.connection_count(), 1);
    assert_eq!(cs.calls_for("BootNotification").len(), 1);

    assert!(matches!(cp.shutdown().await, Err(EngineError::BootRejected)));
}

#[tokio::test]
async fn test_wait_registered_times_out() {
    let app = App::new(0);
    let behavior = CsBehavior::accepting().with_silent_action("BootNotification");
    let (cs, cp) = start(behavior, 1, &app).await;

    let began = Instant::now();
    let result = cp.wait_registered(Duration::from_millis(300)).await;
    assert!(
        matches!(
            result,
            Err(EngineError::Call(CallError::Timeout {
                action: Action::BootNotification,
                ..
            }))
        ),
        "{:?}",
        result
    );
    assert!(began.elapsed() >= Duration::from_millis(300));
    assert!(!cp.is_registered());
    assert_eq!(cs.connection_count(), 1);

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_blocked_tag_cannot_start() {
    let app = App::new(0);
    let (cs, cp) = start(
        CsBehavior::accepting().with_tag_status("BAD_TAG", "Blocked"),
        1,
        &app,
    )
    .await;
    cp.wait_registered(WAIT).await.unwrap();

    let handle = cp.session_open(1).unwrap();
    let status = cp.authorize(&handle, "BAD_TAG", CALL_TIMEOUT).await.unwrap();
    assert_eq!(status, AuthorizationStatus::Blocked);
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Idle);

    let result = cp.start_transaction(&handle, 0, 1, CALL_TIMEOUT).await;
    assert!(
        matches!(result, Err(EngineError::Session(SessionError::NotAuthorized(1)))),
        "{:?}",
        result
    );
    assert!(cs.calls_for("StartTransaction").is_empty());

    cp.session_close(handle).unwrap();
    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_direct_session_start_and_stop() {
    let app = App::new(1000);
    let (cs, cp) = start(CsBehavior::accepting(), 1, &app).await;
    cp.wait_registered(WAIT).await.unwrap();

    let handle = cp.session_open(1).unwrap();
    assert!(matches!(
        cp.present_credential(1, "OTHER"),
        Err(EngineError::Session(SessionError::Busy(1)))
    ));

    let status = cp.authorize(&handle, "04E91C5A", CALL_TIMEOUT).await.unwrap();
    assert_eq!(status, AuthorizationStatus::Accepted);
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Authorizing);

    let transaction_id = cp
        .start_transaction(&handle, 1000, 1, CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(transaction_id, 1);
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Charging);

    let summary = cp.stop_transaction(&handle, 1000, CALL_TIMEOUT).await.unwrap();
    assert_eq!(summary.transaction_id, 1);
    assert_eq!(summary.energy_wh, 0);
    assert!(summary.reported);
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Idle);

    let start = &cs.calls_for("StartTransaction")[0];
    assert_eq!(start.payload["connectorId"], 1);
    assert_eq!(start.payload["idTag"], "04E91C5A");
    assert_eq!(start.payload["meterStart"], 1000);
    let stop = stop_call(&cs, 1).await;
    assert_eq!(stop.payload["meterStop"], 1000);
    assert_eq!(stop.payload["reason"], "Local");

    cp.session_close(handle).unwrap();
    assert!(cp.session_snapshot(1).unwrap().transaction_id.is_none());
    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_on_other_connector_is_rejected() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 2, &app).await;
    cp.wait_registered(WAIT).await.unwrap();

    let handle = cp.session_open(1).unwrap();
    cp.authorize(&handle, "04E91C5A", CALL_TIMEOUT).await.unwrap();

    let result = cp.start_transaction(&handle, 0, 2, CALL_TIMEOUT).await;
    assert!(
        matches!(
            result,
            Err(EngineError::Session(SessionError::ConnectorMismatch {
                handle: 1,
                requested: 2
            }))
        ),
        "{:?}",
        result
    );
    assert!(cs.calls_for("StartTransaction").is_empty());

    cp.session_close(handle).unwrap();
    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unanswered_authorize_times_out() {
    let app = App::new(0);
    let behavior = CsBehavior::accepting().with_silent_action("Authorize");
    let (_cs, cp) = start(behavior, 1, &app).await;
    cp.wait_registered(WAIT).await.unwrap();

    let handle = cp.session_open(1).unwrap();
    let began = Instant::now();
    let result = cp
        .authorize(&handle, "04E91C5A", Duration::from_millis(500))
        .await;
    let elapsed = began.elapsed();

    assert!(
        matches!(result, Err(EngineError::Call(CallError::Timeout { .. }))),
        "{:?}",
        result
    );
    assert!(elapsed >= Duration::from_millis(500), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
    assert_eq!(cp.pending_calls(), 0);
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Idle);

    cp.session_close(handle).unwrap();
    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_periodic_meter_values_while_charging() {
    let app = App::new(2500);
    let (cs, cp) = start(CsBehavior::accepting(), 1, &app).await;
    let mut events = cp.subscribe();
    cp.wait_registered(WAIT).await.unwrap();

    cp.present_credential(1, "04E91C5A").unwrap();
    let transaction_id = wait_started(&mut events, 1).await;

    let samples = cs.wait_for_calls("MeterValues", 2, WAIT).await.unwrap();
    for call in &samples {
        assert_eq!(call.payload["connectorId"], 1);
        assert_eq!(call.payload["transactionId"], transaction_id);
        let sampled = &call.payload["meterValue"][0]["sampledValue"];
        assert_eq!(sampled[0]["context"], "Sample.Periodic");
        assert_eq!(sampled[0]["measurand"], "Energy.Active.Import.Register");
        assert_eq!(sampled[0]["value"], "2500");
    }

    cp.request_stop(1).unwrap();
    let stop = stop_call(&cs, transaction_id).await;
    assert_eq!(stop.payload["reason"], "Local");
    wait_state(&cp, 1, SessionState::Idle).await;

    // local stop is the application's own decision, no StopCharging notify
    assert!(!app
        .notified()
        .iter()
        .any(|n| matches!(n, Notify::StopCharging { .. })));

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_stop_targets_its_connector() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 2, &app).await;
    let mut events = cp.subscribe();
    cp.wait_registered(WAIT).await.unwrap();

    cp.present_credential(1, "TAG-A").unwrap();
    let first = wait_started(&mut events, 1).await;
    cp.present_credential(2, "TAG-B").unwrap();
    let second = wait_started(&mut events, 2).await;

    let answer = cs.remote_stop(second).await.unwrap();
    assert_eq!(answer, json!({ "status": "Accepted" }));

    let stop = stop_call(&cs, second).await;
    assert_eq!(stop.payload["reason"], "Remote");
    wait_state(&cp, 2, SessionState::Idle).await;
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Charging);
    assert_eq!(cp.session_snapshot(1).unwrap().transaction_id, Some(first));

    app.wait_notified(Notify::StopCharging {
        connector_id: 2,
        transaction_id: Some(second),
    })
    .await;

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_stop_of_direct_session_notifies_application() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 1, &app).await;
    cp.wait_registered(WAIT).await.unwrap();

    let handle = cp.session_open(1).unwrap();
    cp.authorize(&handle, "04E91C5A", CALL_TIMEOUT).await.unwrap();
    let transaction_id = cp.start_transaction(&handle, 0, 1, CALL_TIMEOUT).await.unwrap();

    let answer = cs.remote_stop(transaction_id).await.unwrap();
    assert_eq!(answer["status"], "Accepted");

    // the application owns this session, so the engine only asks it to stop
    app.wait_notified(Notify::StopCharging {
        connector_id: 1,
        transaction_id: Some(transaction_id),
    })
    .await;
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Charging);
    assert!(cs.calls_for("StopTransaction").is_empty());

    cp.stop_transaction(&handle, 0, CALL_TIMEOUT).await.unwrap();
    let stop = stop_call(&cs, transaction_id).await;
    assert_eq!(stop.payload["reason"], "Local");

    cp.session_close(handle).unwrap();
    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_stop_while_idle_is_noop() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 1, &app).await;
    cp.wait_registered(WAIT).await.unwrap();

    let answer = cs.remote_stop(42).await.unwrap();
    assert_eq!(answer["status"], "Accepted");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(cs.calls_for("StopTransaction").is_empty());
    assert_eq!(cp.session_state(1).unwrap(), SessionState::Idle);

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_start_picks_free_connector() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 2, &app).await;
    let mut events = cp.subscribe();
    cp.wait_registered(WAIT).await.unwrap();

    cp.present_credential(1, "LOCAL").unwrap();
    wait_started(&mut events, 1).await;

    let answer = cs.remote_start(None, "REMOTE").await.unwrap();
    assert_eq!(answer["status"], "Accepted");
    wait_started(&mut events, 2).await;

    let start = cs
        .wait_for_call_matching("StartTransaction", |p| p["idTag"] == "REMOTE", WAIT)
        .await
        .unwrap();
    assert_eq!(start.payload["connectorId"], 2);
    app.wait_notified(Notify::StartCharging {
        connector_id: 2,
        id_tag: "REMOTE".to_string(),
    })
    .await;

    // every connector busy now
    let answer = cs.remote_start(None, "ANOTHER").await.unwrap();
    assert_eq!(answer["status"], "Rejected");
    let answer = cs.remote_start(Some(1), "ANOTHER").await.unwrap();
    assert_eq!(answer["status"], "Rejected");

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unlock_while_charging_stops_then_unlocks() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 1, &app).await;
    let mut events = cp.subscribe();
    cp.wait_registered(WAIT).await.unwrap();

    cp.present_credential(1, "04E91C5A").unwrap();
    let transaction_id = wait_started(&mut events, 1).await;

    let answer = cs.unlock(1).await.unwrap();
    assert_eq!(answer["status"], "Unlocked");

    let stop = stop_call(&cs, transaction_id).await;
    assert_eq!(stop.payload["reason"], "UnlockCommand");

    app.wait_notified(Notify::UnlockConnector { connector_id: 1 })
        .await;
    let notified = app.notified();
    let stop_at = notified
        .iter()
        .position(|n| matches!(n, Notify::StopCharging { .. }))
        .unwrap();
    let unlock_at = notified
        .iter()
        .position(|n| matches!(n, Notify::UnlockConnector { .. }))
        .unwrap();
    assert!(stop_at < unlock_at);

    let answer = cs.unlock(9).await.unwrap();
    assert_eq!(answer["status"], "NotSupported");

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_energy_limit_ends_transaction() {
    let app = App::new(1000);
    let cs = FakeCentralSystem::start(CsBehavior::accepting()).await.unwrap();
    let config = config(cs.port(), 1).with_limits(ChargeLimits {
        energy_wh: Some(500),
        duration: None,
    });
    let cp = ChargePoint::init(config, app.callback()).unwrap();
    let mut events = cp.subscribe();
    cp.wait_registered(WAIT).await.unwrap();

    cp.present_credential(1, "04E91C5A").unwrap();
    let transaction_id = wait_started(&mut events, 1).await;
    app.set_energy(1600);

    let stop = stop_call(&cs, transaction_id).await;
    assert_eq!(stop.payload["reason"], "Other");
    assert_eq!(stop.payload["meterStop"], 1600);

    match wait_event(&mut events, |e| matches!(e, EngineEvent::TransactionStopped { .. })).await {
        EngineEvent::TransactionStopped { summary, .. } => {
            assert_eq!(summary.meter_start, 1000);
            assert_eq!(summary.energy_wh, 600);
        }
        other => panic!("unexpected event {:?}", other),
    }

    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transport_loss_faults_and_replays_stop() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 1, &app).await;
    let mut events = cp.subscribe();
    cp.wait_registered(WAIT).await.unwrap();

    cp.present_credential(1, "04E91C5A").unwrap();
    let transaction_id = wait_started(&mut events, 1).await;

    cs.drop_connection();
    wait_event(&mut events, |e| {
        matches!(e, EngineEvent::StateChanged { to: SessionState::Faulted, .. })
    })
    .await;

    let stop = stop_call(&cs, transaction_id).await;
    assert_eq!(stop.payload["reason"], "PowerLoss");
    assert_eq!(stop.connection, 2);
    assert!(cs.connection_count() >= 2);
    assert_eq!(cs.calls_for("BootNotification").len(), 2);

    wait_state(&cp, 1, SessionState::Idle).await;
    cp.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_running_transaction() {
    let app = App::new(0);
    let (cs, cp) = start(CsBehavior::accepting(), 1, &app).await;
    let mut events = cp.subscribe();
    cp.wait_registered(WAIT).await.unwrap();

    cp.present_credential(1, "04E91C5A").unwrap();
    let transaction_id = wait_started(&mut events, 1).await;

    cp.shutdown().await.unwrap();

    let stop = &cs.calls_for("StopTransaction")[0];
    assert_eq!(stop.payload["transactionId"], transaction_id);
    assert_eq!(stop.payload["reason"], "Other");
    assert!(matches!(cp.shutdown().await, Err(EngineError::Shutdown)));
}
