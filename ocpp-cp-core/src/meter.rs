//! Engine / application boundary
//!
//! The application hands the engine one notify callback. The engine calls
//! it with a closed set of reasons: pull a meter reading, start charging
//! after a remote start, stop charging, unlock a connector.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::error::NotifyError;
use crate::ocpp::{Measurand, MeterValue, ReadingContext, SampledValue, UnitOfMeasure};

/// Why the engine is calling the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notify {
    /// Return a live reading for `measurand`
    GetMeterValue { connector_id: u32, measurand: Measurand },
    /// A remote start arrived for this connector
    StartCharging { connector_id: u32, id_tag: String },
    /// Charging on this connector must stop
    StopCharging {
        connector_id: u32,
        transaction_id: Option<i32>,
    },
    /// Release the connector lock
    UnlockConnector { connector_id: u32 },
}

/// Application answer to a notify call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyReply {
    Ack,
    /// Formatted meter value, in the measurand's default unit
    Reading(String),
}

/// Application callback; user data lives in the closure
pub type NotifyCallback = Arc<dyn Fn(Notify) -> Result<NotifyReply, NotifyError> + Send + Sync>;

/// One sampled value, produced on demand
#[derive(Debug, Clone, PartialEq)]
pub struct MeterReading {
    pub connector_id: u32,
    pub measurand: Measurand,
    pub value: String,
    pub unit: Option<UnitOfMeasure>,
}

impl MeterReading {
    pub fn to_sampled_value(&self, context: ReadingContext) -> SampledValue {
        SampledValue {
            value: self.value.clone(),
            context: Some(context),
            measurand: Some(self.measurand),
            unit: self.unit,
        }
    }

    /// Energy register in whole Wh, if this is a parsable energy reading
    pub fn as_wh(&self) -> Option<i32> {
        if self.measurand != Measurand::EnergyActiveImportRegister {
            return None;
        }
        let value: f64 = self.value.trim().parse().ok()?;
        let wh = match self.unit {
            Some(UnitOfMeasure::KWh) => value * 1000.0,
            _ => value,
        };
        Some(wh.round() as i32)
    }
}

/// Source of live meter data
pub trait MeterProvider: Send + Sync {
    fn read(&self, connector_id: u32, measurand: Measurand) -> Result<MeterReading, NotifyError>;
}

/// Meter provider backed by the application's notify callback
pub struct NotifyMeterProvider {
    notify: NotifyCallback,
}

impl NotifyMeterProvider {
    pub fn new(notify: NotifyCallback) -> Self {
        Self { notify }
    }
}

impl MeterProvider for NotifyMeterProvider {
    fn read(&self, connector_id: u32, measurand: Measurand) -> Result<MeterReading, NotifyError> {
        match (self.notify)(Notify::GetMeterValue {
            connector_id,
            measurand,
        })? {
            NotifyReply::Reading(value) => Ok(MeterReading {
                connector_id,
                measurand,
                value,
                unit: Some(measurand.default_unit()),
            }),
            NotifyReply::Ack => Err(NotifyError(format!(
                "no reading for {:?} on connector {}",
                measurand, connector_id
            ))),
        }
    }
}

/// Read every measurand; failures are logged and skipped
pub fn sample(
    provider: &dyn MeterProvider,
    connector_id: u32,
    measurands: &[Measurand],
) -> Vec<MeterReading> {
    measurands
        .iter()
        .filter_map(|m| match provider.read(connector_id, *m) {
            Ok(reading) => Some(reading),
            Err(e) => {
                warn!(connector_id, measurand = ?m, "Meter read failed: {}", e);
                None
            }
        })
        .collect()
}

/// Bundle readings into one timestamped MeterValue
pub fn meter_value(readings: &[MeterReading], context: ReadingContext) -> MeterValue {
    MeterValue {
        timestamp: Utc::now(),
        sampled_value: readings.iter().map(|r| r.to_sampled_value(context)).collect(),
    }
}

/// Call the application off the async workers; the callback may block on hardware
pub(crate) async fn notify_app(
    notify: &NotifyCallback,
    event: Notify,
) -> Result<NotifyReply, NotifyError> {
    let notify = notify.clone();
    tokio::task::spawn_blocking(move || notify(event))
        .await
        .map_err(|e| NotifyError(format!("callback panicked: {}", e)))?
}

/// Read one measurand off the async workers
pub(crate) async fn read_blocking(
    provider: &Arc<dyn MeterProvider>,
    connector_id: u32,
    measurand: Measurand,
) -> Result<MeterReading, NotifyError> {
    let provider = provider.clone();
    tokio::task::spawn_blocking(move || provider.read(connector_id, measurand))
        .await
        .map_err(|e| NotifyError(format!("meter read panicked: {}", e)))?
}

/// Sample all measurands off the async workers
pub(crate) async fn sample_blocking(
    provider: &Arc<dyn MeterProvider>,
    connector_id: u32,
    measurands: &[Measurand],
) -> Vec<MeterReading> {
    let provider = provider.clone();
    let measurands = measurands.to_vec();
    let readings =
        tokio::task::spawn_blocking(move || sample(provider.as_ref(), connector_id, &measurands));
    match readings.await {
        Ok(readings) => readings,
        Err(e) => {
            warn!(connector_id, "Meter sampling panicked: {}", e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_meter() -> NotifyCallback {
        Arc::new(|notify: Notify| match notify {
            Notify::GetMeterValue { measurand: Measurand::EnergyActiveImportRegister, .. } => {
                Ok(NotifyReply::Reading("1520.6".into()))
            }
            Notify::GetMeterValue { measurand: Measurand::Voltage, .. } => {
                Err(NotifyError("ADC offline".into()))
            }
            Notify::GetMeterValue { .. } => Ok(NotifyReply::Reading("7400".into())),
            _ => Ok(NotifyReply::Ack),
        })
    }

    #[test]
    fn test_notify_provider_reads() {
        let provider = NotifyMeterProvider::new(fixed_meter());
        let reading = provider.read(1, Measurand::EnergyActiveImportRegister).unwrap();

        assert_eq!(reading.value, "1520.6");
        assert_eq!(reading.unit, Some(UnitOfMeasure::Wh));
        assert_eq!(reading.as_wh(), Some(1521));
    }

    #[test]
    fn test_sample_skips_failed_measurands() {
        let provider = NotifyMeterProvider::new(fixed_meter());
        let readings = sample(
            &provider,
            2,
            &[
                Measurand::EnergyActiveImportRegister,
                Measurand::Voltage,
                Measurand::PowerActiveImport,
            ],
        );

        assert_eq!(readings.len(), 2);
        assert!(readings.iter().all(|r| r.connector_id == 2));

        let value = meter_value(&readings, ReadingContext::SamplePeriodic);
        assert_eq!(value.sampled_value.len(), 2);
        assert_eq!(value.sampled_value[1].measurand, Some(Measurand::PowerActiveImport));
    }

    #[test]
    fn test_kwh_register_is_scaled() {
        let reading = MeterReading {
            connector_id: 1,
            measurand: Measurand::EnergyActiveImportRegister,
            value: "12.5".into(),
            unit: Some(UnitOfMeasure::KWh),
        };
        assert_eq!(reading.as_wh(), Some(12500));

        let power = MeterReading {
            measurand: Measurand::PowerActiveImport,
            ..reading
        };
        assert_eq!(power.as_wh(), None);
    }

    #[test]
    fn test_ack_is_not_a_reading() {
        let callback: NotifyCallback = Arc::new(|_: Notify| Ok(NotifyReply::Ack));
        let provider = NotifyMeterProvider::new(callback);
        assert!(provider.read(1, Measurand::SoC).is_err());
    }
}
