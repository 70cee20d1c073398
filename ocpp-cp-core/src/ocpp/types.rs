//! OCPP 1.6 message payloads
//!
//! Only the messages the charge point engine sends or answers:
//! - BootNotification / Heartbeat
//! - Authorize / StartTransaction / StopTransaction
//! - MeterValues / StatusNotification
//! - RemoteStartTransaction / RemoteStopTransaction / UnlockConnector

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::messages::Action;

/// A request the charge point sends, tied to its action and response type
pub trait OcppRequest: Serialize {
    const ACTION: Action;
    type Response: DeserializeOwned;
}

// ============================================================================
// Enumerations
// ============================================================================

/// Result of an authorization check by the Central System
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Accepted,
    Blocked,
    Expired,
    Invalid,
    ConcurrentTx,
}

impl AuthorizationStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthorizationStatus::Accepted)
    }
}

/// Registration status for BootNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Connector status reported in StatusNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEVSE,
    SuspendedEV,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

/// Error code reported in StatusNotification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointErrorCode {
    NoError,
    ConnectorLockFailure,
    InternalError,
    OtherError,
}

/// Reason a transaction was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    DeAuthorized,
    EmergencyStop,
    EVDisconnected,
    HardReset,
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
}

/// Status answered to RemoteStartTransaction / RemoteStopTransaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStartStopStatus {
    Accepted,
    Rejected,
}

/// Status answered to UnlockConnector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlockStatus {
    Unlocked,
    UnlockFailed,
    NotSupported,
}

/// Measurand types for meter values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measurand {
    #[serde(rename = "Energy.Active.Import.Register")]
    EnergyActiveImportRegister,
    #[serde(rename = "Power.Active.Import")]
    PowerActiveImport,
    #[serde(rename = "Current.Import")]
    CurrentImport,
    #[serde(rename = "Current.Offered")]
    CurrentOffered,
    #[serde(rename = "Voltage")]
    Voltage,
    #[serde(rename = "Temperature")]
    Temperature,
    #[serde(rename = "SoC")]
    SoC,
}

impl Measurand {
    /// Default unit the engine reports for this measurand
    pub fn default_unit(&self) -> UnitOfMeasure {
        match self {
            Measurand::EnergyActiveImportRegister => UnitOfMeasure::Wh,
            Measurand::PowerActiveImport => UnitOfMeasure::W,
            Measurand::CurrentImport | Measurand::CurrentOffered => UnitOfMeasure::A,
            Measurand::Voltage => UnitOfMeasure::V,
            Measurand::Temperature => UnitOfMeasure::Celsius,
            Measurand::SoC => UnitOfMeasure::Percent,
        }
    }
}

/// Reading context for meter values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingContext {
    #[serde(rename = "Sample.Periodic")]
    SamplePeriodic,
    #[serde(rename = "Transaction.Begin")]
    TransactionBegin,
    #[serde(rename = "Transaction.End")]
    TransactionEnd,
    Trigger,
}

/// Unit of measure for sampled values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitOfMeasure {
    Wh,
    #[serde(rename = "kWh")]
    KWh,
    W,
    #[serde(rename = "kW")]
    KW,
    A,
    V,
    Celsius,
    Percent,
}

// ============================================================================
// Complex Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdTagInfo {
    pub status: AuthorizationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ReadingContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<Measurand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitOfMeasure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_value: Vec<SampledValue>,
}

// ============================================================================
// Charge point initiated
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub status: RegistrationStatus,
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval (Accepted) or retry delay (Pending/Rejected), seconds
    pub interval: i32,
}

impl OcppRequest for BootNotificationRequest {
    const ACTION: Action = Action::BootNotification;
    type Response = BootNotificationResponse;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

impl OcppRequest for HeartbeatRequest {
    const ACTION: Action = Action::Heartbeat;
    type Response = HeartbeatResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    pub id_tag_info: IdTagInfo,
}

impl OcppRequest for AuthorizeRequest {
    const ACTION: Action = Action::Authorize;
    type Response = AuthorizeResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionRequest {
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTransactionResponse {
    pub id_tag_info: IdTagInfo,
    pub transaction_id: i32,
}

impl OcppRequest for StartTransactionRequest {
    const ACTION: Action = Action::StartTransaction;
    type Response = StartTransactionResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tag: Option<String>,
    pub meter_stop: i32,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTransactionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_tag_info: Option<IdTagInfo>,
}

impl OcppRequest for StopTransactionRequest {
    const ACTION: Action = Action::StopTransaction;
    type Response = StopTransactionResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub connector_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeterValuesResponse {}

impl OcppRequest for MeterValuesRequest {
    const ACTION: Action = Action::MeterValues;
    type Response = MeterValuesResponse;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: u32,
    pub error_code: ChargePointErrorCode,
    pub status: ChargePointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

impl OcppRequest for StatusNotificationRequest {
    const ACTION: Action = Action::StatusNotification;
    type Response = StatusNotificationResponse;
}

// ============================================================================
// Central System initiated
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStartTransactionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<u32>,
    pub id_tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStartTransactionResponse {
    pub status: RemoteStartStopStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStopTransactionRequest {
    pub transaction_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStopTransactionResponse {
    pub status: RemoteStartStopStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnlockConnectorRequest {
    pub connector_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockConnectorResponse {
    pub status: UnlockStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_notification_field_names() {
        let req = BootNotificationRequest {
            charge_point_vendor: "Elektrokombinacija".into(),
            charge_point_model: "EK3".into(),
            charge_point_serial_number: Some("SN-1".into()),
            firmware_version: None,
            meter_type: Some("DIN-RAIL".into()),
        };
        let value = serde_json::to_value(&req).unwrap();

        assert_eq!(value["chargePointVendor"], "Elektrokombinacija");
        assert_eq!(value["chargePointSerialNumber"], "SN-1");
        assert_eq!(value["meterType"], "DIN-RAIL");
        assert!(value.get("firmwareVersion").is_none());
    }

    #[test]
    fn test_meter_values_wire_names() {
        let req = MeterValuesRequest {
            connector_id: 2,
            transaction_id: Some(7),
            meter_value: vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![SampledValue {
                    value: "1234".into(),
                    context: Some(ReadingContext::SamplePeriodic),
                    measurand: Some(Measurand::EnergyActiveImportRegister),
                    unit: Some(UnitOfMeasure::Wh),
                }],
            }],
        };
        let value = serde_json::to_value(&req).unwrap();
        let sample = &value["meterValue"][0]["sampledValue"][0];

        assert_eq!(sample["measurand"], "Energy.Active.Import.Register");
        assert_eq!(sample["context"], "Sample.Periodic");
        assert_eq!(sample["unit"], "Wh");
        assert_eq!(value["transactionId"], 7);
    }

    #[test]
    fn test_remote_start_without_connector() {
        let req: RemoteStartTransactionRequest =
            serde_json::from_str(r#"{"idTag": "TAG-1"}"#).unwrap();
        assert_eq!(req.connector_id, None);
        assert_eq!(req.id_tag, "TAG-1");
    }

    #[test]
    fn test_stop_transaction_response_may_omit_tag_info() {
        let resp: StopTransactionResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.id_tag_info.is_none());
    }
}
