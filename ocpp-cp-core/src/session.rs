//! Connector session table
//!
//! One slot per physical connector, allocated once at init. A slot is
//! claimed by `open` and released by `close`; the handle carries the slot
//! generation so a handle kept past `close` is rejected.
//!
//! Transitions:
//! ```text
//! Idle -> Preparing -> Authorizing -> Charging -> Finishing -> Idle
//!          |              |
//!          +----> Idle <--+            (rejected / abandoned)
//! any -> Faulted -> Finishing | Idle
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::events::{EngineEvent, EventBus};
use crate::ocpp::{AuthorizationStatus, ChargePointStatus};

/// Lifecycle state of a connector session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    #[default]
    Idle,
    Preparing,
    Authorizing,
    Charging,
    Finishing,
    Faulted,
}

impl SessionState {
    /// Whether `self -> next` is an edge of the session lifecycle
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if next == Faulted {
            return self != Faulted;
        }
        matches!(
            (self, next),
            (Idle, Preparing)
                | (Preparing, Authorizing)
                | (Preparing, Idle)
                | (Authorizing, Charging)
                | (Authorizing, Idle)
                | (Charging, Finishing)
                | (Finishing, Idle)
                | (Faulted, Finishing)
                | (Faulted, Idle)
        )
    }

    /// Connector status reported to the Central System
    pub fn status(self) -> ChargePointStatus {
        match self {
            SessionState::Idle => ChargePointStatus::Available,
            SessionState::Preparing | SessionState::Authorizing => ChargePointStatus::Preparing,
            SessionState::Charging => ChargePointStatus::Charging,
            SessionState::Finishing => ChargePointStatus::Finishing,
            SessionState::Faulted => ChargePointStatus::Faulted,
        }
    }
}

/// Claim on one connector slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    connector_id: u32,
    generation: u64,
}

impl SessionHandle {
    pub fn connector_id(&self) -> u32 {
        self.connector_id
    }
}

/// Result of a completed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    pub connector_id: u32,
    pub transaction_id: i32,
    pub id_tag: Option<String>,
    pub meter_start: i32,
    pub meter_stop: i32,
    /// meter_stop - meter_start
    pub energy_wh: i32,
    /// Central System acknowledged the StopTransaction
    pub reported: bool,
}

/// What a StopTransaction needs to carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStop {
    pub transaction_id: i32,
    pub id_tag: Option<String>,
    pub meter_start: i32,
}

/// Point-in-time copy of a slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub connector_id: u32,
    pub in_use: bool,
    pub state: SessionState,
    pub id_tag: Option<String>,
    pub auth_status: Option<AuthorizationStatus>,
    pub transaction_id: Option<i32>,
    pub meter_start: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SessionData {
    state: SessionState,
    generation: u64,
    id_tag: Option<String>,
    auth_status: Option<AuthorizationStatus>,
    transaction_id: Option<i32>,
    meter_start: Option<i32>,
    started_at: Option<DateTime<Utc>>,
}

impl SessionData {
    fn clear(&mut self) {
        self.id_tag = None;
        self.auth_status = None;
        self.transaction_id = None;
        self.meter_start = None;
        self.started_at = None;
    }
}

#[derive(Debug)]
struct SessionSlot {
    connector_id: u32,
    in_use: AtomicBool,
    data: Mutex<SessionData>,
}

/// Fixed arena of connector sessions, indexed by connector id (1-based)
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<SessionSlot>,
    events: EventBus,
}

impl SessionTable {
    pub fn new(connector_count: u32, events: EventBus) -> Self {
        let slots = (1..=connector_count)
            .map(|connector_id| SessionSlot {
                connector_id,
                in_use: AtomicBool::new(false),
                data: Mutex::new(SessionData::default()),
            })
            .collect();
        Self { slots, events }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn connector_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.iter().map(|s| s.connector_id)
    }

    fn slot(&self, connector_id: u32) -> Result<&SessionSlot, SessionError> {
        connector_id
            .checked_sub(1)
            .and_then(|i| self.slots.get(i as usize))
            .ok_or(SessionError::UnknownConnector(connector_id))
    }

    /// Lock the slot a handle refers to, rejecting stale handles
    fn locked(
        &self,
        handle: &SessionHandle,
    ) -> Result<parking_lot::MutexGuard<'_, SessionData>, SessionError> {
        let slot = self.slot(handle.connector_id)?;
        let data = slot.data.lock();
        if !slot.in_use.load(Ordering::Acquire) || data.generation != handle.generation {
            return Err(SessionError::StaleHandle(handle.connector_id));
        }
        Ok(data)
    }

    fn transition(
        &self,
        connector_id: u32,
        data: &mut SessionData,
        to: SessionState,
    ) -> Result<(), SessionError> {
        let from = data.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(SessionError::IllegalTransition {
                connector_id,
                from,
                to,
            });
        }
        data.state = to;
        debug!(connector_id, ?from, ?to, "Session state changed");
        self.events.publish(EngineEvent::StateChanged {
            connector_id,
            from,
            to,
        });
        Ok(())
    }

    /// Claim the connector's slot
    pub fn open(&self, connector_id: u32) -> Result<SessionHandle, SessionError> {
        let slot = self.slot(connector_id)?;
        if slot
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Busy(connector_id));
        }
        let mut data = slot.data.lock();
        data.generation += 1;
        Ok(SessionHandle {
            connector_id,
            generation: data.generation,
        })
    }

    /// Release the slot; the session is reset to Idle whatever its state
    pub fn close(&self, handle: SessionHandle) -> Result<(), SessionError> {
        let slot = self.slot(handle.connector_id)?;
        let mut data = self.locked(&handle)?;

        if let Some(transaction_id) = data.transaction_id {
            warn!(
                connector_id = handle.connector_id,
                transaction_id, "Closing session with an open transaction"
            );
        }

        let from = data.state;
        data.clear();
        data.state = SessionState::Idle;
        data.generation += 1;
        slot.in_use.store(false, Ordering::Release);

        if from != SessionState::Idle {
            self.events.publish(EngineEvent::StateChanged {
                connector_id: handle.connector_id,
                from,
                to: SessionState::Idle,
            });
        }
        Ok(())
    }

    /// Bind a credential; Idle -> Preparing
    pub fn prepare(&self, handle: &SessionHandle, id_tag: &str) -> Result<(), SessionError> {
        let mut data = self.locked(handle)?;
        if data.state != SessionState::Preparing {
            self.transition(handle.connector_id, &mut data, SessionState::Preparing)?;
        }
        data.id_tag = Some(id_tag.to_string());
        data.auth_status = None;
        Ok(())
    }

    /// Authorize request is going out; Preparing -> Authorizing
    pub fn begin_authorize(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let mut data = self.locked(handle)?;
        if data.state == SessionState::Authorizing {
            return Err(SessionError::IllegalTransition {
                connector_id: handle.connector_id,
                from: data.state,
                to: SessionState::Authorizing,
            });
        }
        self.transition(handle.connector_id, &mut data, SessionState::Authorizing)
    }

    /// Record the authorization decision; anything but Accepted returns to Idle
    pub fn finish_authorize(
        &self,
        handle: &SessionHandle,
        status: AuthorizationStatus,
    ) -> Result<(), SessionError> {
        let mut data = self.locked(handle)?;
        if data.state != SessionState::Authorizing {
            return Err(SessionError::IllegalTransition {
                connector_id: handle.connector_id,
                from: data.state,
                to: SessionState::Authorizing,
            });
        }
        data.auth_status = Some(status);
        if !status.is_accepted() {
            self.transition(handle.connector_id, &mut data, SessionState::Idle)?;
            data.id_tag = None;
        }
        Ok(())
    }

    /// Abandon a session that never started a transaction
    pub fn release(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let mut data = self.locked(handle)?;
        if data.transaction_id.is_some() {
            return Err(SessionError::IllegalTransition {
                connector_id: handle.connector_id,
                from: data.state,
                to: SessionState::Idle,
            });
        }
        self.transition(handle.connector_id, &mut data, SessionState::Idle)?;
        data.clear();
        Ok(())
    }

    /// Check that a StartTransaction may go out; returns the authorized id tag
    pub fn begin_start(&self, handle: &SessionHandle) -> Result<String, SessionError> {
        let data = self.locked(handle)?;
        match data.state {
            SessionState::Charging => Err(SessionError::AlreadyCharging(handle.connector_id)),
            SessionState::Idle | SessionState::Preparing | SessionState::Authorizing => {
                match (&data.id_tag, data.auth_status) {
                    (Some(id_tag), Some(AuthorizationStatus::Accepted))
                        if data.state == SessionState::Authorizing =>
                    {
                        Ok(id_tag.clone())
                    }
                    _ => Err(SessionError::NotAuthorized(handle.connector_id)),
                }
            }
            from => Err(SessionError::IllegalTransition {
                connector_id: handle.connector_id,
                from,
                to: SessionState::Charging,
            }),
        }
    }

    /// Central System accepted the transaction; Authorizing -> Charging
    pub fn confirm_start(
        &self,
        handle: &SessionHandle,
        transaction_id: i32,
        meter_start: i32,
    ) -> Result<(), SessionError> {
        let mut data = self.locked(handle)?;
        self.transition(handle.connector_id, &mut data, SessionState::Charging)?;
        data.transaction_id = Some(transaction_id);
        data.meter_start = Some(meter_start);
        data.started_at = Some(Utc::now());
        Ok(())
    }

    /// StopTransaction is going out; Charging | Faulted -> Finishing
    pub fn begin_stop(&self, handle: &SessionHandle) -> Result<PendingStop, SessionError> {
        let mut data = self.locked(handle)?;
        let transaction_id = data
            .transaction_id
            .ok_or(SessionError::NoTransaction(handle.connector_id))?;
        self.transition(handle.connector_id, &mut data, SessionState::Finishing)?;
        Ok(PendingStop {
            transaction_id,
            id_tag: data.id_tag.clone(),
            meter_start: data.meter_start.unwrap_or(0),
        })
    }

    /// Transaction is over; Finishing -> Idle
    pub fn finish_stop(
        &self,
        handle: &SessionHandle,
        meter_stop: i32,
    ) -> Result<TransactionSummary, SessionError> {
        let mut data = self.locked(handle)?;
        if data.state != SessionState::Finishing {
            return Err(SessionError::IllegalTransition {
                connector_id: handle.connector_id,
                from: data.state,
                to: SessionState::Idle,
            });
        }
        let transaction_id = data
            .transaction_id
            .ok_or(SessionError::NoTransaction(handle.connector_id))?;
        let meter_start = data.meter_start.unwrap_or(0);
        let summary = TransactionSummary {
            connector_id: handle.connector_id,
            transaction_id,
            id_tag: data.id_tag.clone(),
            meter_start,
            meter_stop,
            energy_wh: meter_stop.saturating_sub(meter_start),
            reported: false,
        };
        self.transition(handle.connector_id, &mut data, SessionState::Idle)?;
        data.clear();
        Ok(summary)
    }

    /// Fault one connector; Idle and already-faulted connectors are left alone
    pub fn fault(&self, connector_id: u32) -> Result<bool, SessionError> {
        let slot = self.slot(connector_id)?;
        let mut data = slot.data.lock();
        if matches!(data.state, SessionState::Idle | SessionState::Faulted) {
            return Ok(false);
        }
        self.transition(connector_id, &mut data, SessionState::Faulted)?;
        Ok(true)
    }

    /// Fault every active session; returns the affected connectors
    pub fn fault_active(&self) -> Vec<u32> {
        self.connector_ids()
            .filter(|id| matches!(self.fault(*id), Ok(true)))
            .collect()
    }

    pub fn state(&self, connector_id: u32) -> Result<SessionState, SessionError> {
        Ok(self.slot(connector_id)?.data.lock().state)
    }

    pub fn snapshot(&self, connector_id: u32) -> Result<SessionSnapshot, SessionError> {
        let slot = self.slot(connector_id)?;
        let data = slot.data.lock();
        Ok(SessionSnapshot {
            connector_id,
            in_use: slot.in_use.load(Ordering::Acquire),
            state: data.state,
            id_tag: data.id_tag.clone(),
            auth_status: data.auth_status,
            transaction_id: data.transaction_id,
            meter_start: data.meter_start,
            started_at: data.started_at,
        })
    }

    /// Unclaimed and Idle
    pub fn is_free(&self, connector_id: u32) -> Result<bool, SessionError> {
        let slot = self.slot(connector_id)?;
        let data = slot.data.lock();
        Ok(!slot.in_use.load(Ordering::Acquire) && data.state == SessionState::Idle)
    }

    /// Lowest-numbered free connector
    pub fn first_free(&self) -> Option<u32> {
        self.connector_ids()
            .find(|id| matches!(self.is_free(*id), Ok(true)))
    }

    /// Claim the lowest-numbered free connector
    pub fn open_first_free(&self) -> Option<SessionHandle> {
        self.connector_ids()
            .filter(|id| matches!(self.is_free(*id), Ok(true)))
            .find_map(|id| self.open(id).ok())
    }

    /// Connector currently running `transaction_id`
    pub fn find_transaction(&self, transaction_id: i32) -> Option<u32> {
        self.slots
            .iter()
            .find(|s| s.data.lock().transaction_id == Some(transaction_id))
            .map(|s| s.connector_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(connectors: u32) -> SessionTable {
        SessionTable::new(connectors, EventBus::new(64))
    }

    fn authorized(table: &SessionTable, connector_id: u32) -> SessionHandle {
        let handle = table.open(connector_id).unwrap();
        table.prepare(&handle, "TAG-1").unwrap();
        table.begin_authorize(&handle).unwrap();
        table
            .finish_authorize(&handle, AuthorizationStatus::Accepted)
            .unwrap();
        handle
    }

    #[test]
    fn test_transition_table() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Preparing));
        assert!(Authorizing.can_transition_to(Idle));
        assert!(Charging.can_transition_to(Faulted));
        assert!(Faulted.can_transition_to(Finishing));
        assert!(!Idle.can_transition_to(Charging));
        assert!(!Charging.can_transition_to(Idle));
        assert!(!Finishing.can_transition_to(Charging));
        assert!(!Faulted.can_transition_to(Faulted));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(SessionState::Idle.status(), ChargePointStatus::Available);
        assert_eq!(SessionState::Authorizing.status(), ChargePointStatus::Preparing);
        assert_eq!(SessionState::Faulted.status(), ChargePointStatus::Faulted);
    }

    #[test]
    fn test_open_is_exclusive() {
        let table = table(2);
        let handle = table.open(1).unwrap();

        assert_eq!(table.open(1), Err(SessionError::Busy(1)));
        assert_eq!(table.open(3), Err(SessionError::UnknownConnector(3)));
        assert_eq!(table.open(0), Err(SessionError::UnknownConnector(0)));
        assert!(table.open(2).is_ok());

        table.close(handle).unwrap();
        assert!(table.open(1).is_ok());
    }

    #[test]
    fn test_stale_handle_rejected_after_close() {
        let table = table(1);
        let old = table.open(1).unwrap();
        table.close(old).unwrap();
        let _new = table.open(1).unwrap();

        assert_eq!(table.prepare(&old, "TAG"), Err(SessionError::StaleHandle(1)));
        assert_eq!(table.close(old), Err(SessionError::StaleHandle(1)));
    }

    #[test]
    fn test_full_transaction() {
        let table = table(1);
        let handle = authorized(&table, 1);

        assert_eq!(table.begin_start(&handle).unwrap(), "TAG-1");
        table.confirm_start(&handle, 42, 1000).unwrap();
        assert_eq!(table.state(1).unwrap(), SessionState::Charging);
        assert_eq!(table.find_transaction(42), Some(1));

        let stop = table.begin_stop(&handle).unwrap();
        assert_eq!(stop.transaction_id, 42);
        assert_eq!(stop.meter_start, 1000);

        let summary = table.finish_stop(&handle, 1000).unwrap();
        assert_eq!(summary.energy_wh, 0);
        assert_eq!(summary.transaction_id, 42);
        assert_eq!(table.state(1).unwrap(), SessionState::Idle);
        assert_eq!(table.find_transaction(42), None);
    }

    #[test]
    fn test_rejected_authorization_blocks_start() {
        let table = table(1);
        let handle = table.open(1).unwrap();
        table.prepare(&handle, "BAD_TAG").unwrap();
        table.begin_authorize(&handle).unwrap();
        table
            .finish_authorize(&handle, AuthorizationStatus::Blocked)
            .unwrap();

        assert_eq!(table.state(1).unwrap(), SessionState::Idle);
        assert_eq!(table.begin_start(&handle), Err(SessionError::NotAuthorized(1)));
    }

    #[test]
    fn test_start_without_authorize() {
        let table = table(1);
        let handle = table.open(1).unwrap();
        assert_eq!(table.begin_start(&handle), Err(SessionError::NotAuthorized(1)));
    }

    #[test]
    fn test_fault_and_recover() {
        let table = table(2);
        let handle = authorized(&table, 1);
        table.confirm_start(&handle, 7, 500).unwrap();

        assert_eq!(table.fault_active(), vec![1]);
        assert_eq!(table.state(1).unwrap(), SessionState::Faulted);
        assert_eq!(table.state(2).unwrap(), SessionState::Idle);

        table.begin_stop(&handle).unwrap();
        let summary = table.finish_stop(&handle, 650).unwrap();
        assert_eq!(summary.energy_wh, 150);
    }

    #[test]
    fn test_release_from_faulted_authorization() {
        let table = table(1);
        let handle = table.open(1).unwrap();
        table.prepare(&handle, "TAG").unwrap();
        table.begin_authorize(&handle).unwrap();
        table.fault(1).unwrap();

        table.release(&handle).unwrap();
        assert_eq!(table.state(1).unwrap(), SessionState::Idle);
    }

    #[test]
    fn test_close_resets_open_transaction() {
        let table = table(1);
        let handle = authorized(&table, 1);
        table.confirm_start(&handle, 9, 0).unwrap();

        table.close(handle).unwrap();
        let snapshot = table.snapshot(1).unwrap();
        assert_eq!(snapshot.state, SessionState::Idle);
        assert_eq!(snapshot.transaction_id, None);
        assert!(!snapshot.in_use);
    }

    #[test]
    fn test_first_free_skips_claimed() {
        let table = table(3);
        let _h1 = table.open(1).unwrap();
        assert_eq!(table.first_free(), Some(2));
        let _h2 = table.open(2).unwrap();
        let _h3 = table.open(3).unwrap();
        assert_eq!(table.first_free(), None);
    }

    #[test]
    fn test_open_first_free_claims_in_order() {
        let table = table(2);
        let first = table.open_first_free().unwrap();
        let second = table.open_first_free().unwrap();
        assert_eq!(first.connector_id(), 1);
        assert_eq!(second.connector_id(), 2);
        assert!(table.open_first_free().is_none());

        table.close(first).unwrap();
        assert_eq!(table.open_first_free().map(|h| h.connector_id()), Some(1));
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let table = SessionTable::new(1, bus);

        let handle = table.open(1).unwrap();
        table.prepare(&handle, "TAG").unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::StateChanged {
                connector_id: 1,
                from: SessionState::Idle,
                to: SessionState::Preparing,
            }
        );
    }

    proptest! {
        /// Random operation sequences never break slot invariants
        #[test]
        fn prop_slot_invariants(ops in prop::collection::vec((0u8..9, 1u32..=2), 1..60)) {
            let table = table(2);
            let mut handles: [Option<SessionHandle>; 2] = [None, None];
            let mut next_tx = 1;

            for (op, connector_id) in ops {
                let index = (connector_id - 1) as usize;
                match (op, handles[index]) {
                    (0, None) => handles[index] = table.open(connector_id).ok(),
                    (0, Some(_)) => {
                        let busy = Err(SessionError::Busy(connector_id));
                        prop_assert_eq!(table.open(connector_id), busy);
                    }
                    (1, Some(h)) => {
                        let _ = table.prepare(&h, "TAG").and_then(|_| table.begin_authorize(&h));
                    }
                    (2, Some(h)) => {
                        let _ = table.finish_authorize(&h, AuthorizationStatus::Accepted);
                    }
                    (3, Some(h)) => {
                        let _ = table.finish_authorize(&h, AuthorizationStatus::Invalid);
                    }
                    (4, Some(h)) => {
                        if table.begin_start(&h).is_ok() {
                            let _ = table.confirm_start(&h, next_tx, 100);
                            next_tx += 1;
                        }
                    }
                    (5, Some(h)) => { let _ = table.begin_stop(&h); }
                    (6, Some(h)) => { let _ = table.finish_stop(&h, 200); }
                    (7, Some(h)) => {
                        prop_assert!(table.close(h).is_ok());
                        handles[index] = None;
                    }
                    (8, _) => { table.fault_active(); }
                    _ => {}
                }

                for id in 1..=2 {
                    let snapshot = table.snapshot(id).unwrap();
                    match snapshot.state {
                        SessionState::Charging | SessionState::Finishing => {
                            prop_assert!(snapshot.transaction_id.is_some());
                            let accepted = Some(AuthorizationStatus::Accepted);
                            prop_assert_eq!(snapshot.auth_status, accepted);
                        }
                        SessionState::Idle | SessionState::Preparing => {
                            prop_assert!(snapshot.transaction_id.is_none());
                        }
                        _ => {}
                    }
                    prop_assert_eq!(snapshot.in_use, handles[(id - 1) as usize].is_some());
                }
            }
        }
    }
}
