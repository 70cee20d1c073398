//! Configuration for the charge point engine
//!
//! Plain structs with defaults and chained builders. Everything derives
//! serde so an application can keep the configuration in a JSON file;
//! durations are written as milliseconds.

use std::net::Ipv6Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ocpp::Measurand;
use crate::retry::RetryPolicy;

/// Identity reported in BootNotification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargePointIdentity {
    pub model: String,
    pub vendor: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub meter_type: Option<String>,
    /// Number of physical connectors, numbered 1..=connector_count
    pub connector_count: u32,
}

impl Default for ChargePointIdentity {
    fn default() -> Self {
        Self {
            model: "EK3-OCPP".to_string(),
            vendor: "Elektrokombinacija".to_string(),
            serial_number: None,
            firmware_version: Some("0.1.0".to_string()),
            meter_type: None,
            connector_count: 1,
        }
    }
}

impl ChargePointIdentity {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }

    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_meter_type(mut self, meter_type: impl Into<String>) -> Self {
        self.meter_type = Some(meter_type.into());
        self
    }

    pub fn with_connectors(mut self, count: u32) -> Self {
        self.connector_count = count;
        self
    }

    /// Identity used in the WebSocket URL path
    pub fn charge_point_id(&self) -> &str {
        self.serial_number.as_deref().unwrap_or(&self.model)
    }
}

/// Which IP family to use when resolving the Central System host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn accepts(&self, addr: &std::net::SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Any => write!(f, "any"),
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Where the Central System lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralSystemEndpoint {
    pub host: String,
    pub port: u16,
    /// URL path without the charge point id
    pub path: String,
    pub address_family: AddressFamily,
}

impl Default for CentralSystemEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8180,
            path: "steve/websocket/CentralSystemService".to_string(),
            address_family: AddressFamily::Any,
        }
    }
}

impl CentralSystemEndpoint {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            address_family: AddressFamily::Any,
        }
    }

    pub fn with_address_family(mut self, family: AddressFamily) -> Self {
        self.address_family = family;
        self
    }

    /// Host without IPv6 brackets, as passed to name resolution
    pub fn bare_host(&self) -> &str {
        let host = self.host.trim();
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    /// Full WebSocket URL for the given charge point; IPv6 literals are
    /// bracketed
    pub fn url(&self, charge_point_id: &str) -> String {
        let host = self.bare_host();
        let authority = match host.parse::<Ipv6Addr>() {
            Ok(_) => format!("[{}]:{}", host, self.port),
            Err(_) => format!("{}:{}", host, self.port),
        };
        let base = format!("ws://{}/{}", authority, self.path.trim_matches('/'));
        build_ocpp_url(&base, charge_point_id)
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, charge_point_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), charge_point_id)
}

/// WebSocket transport limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    pub max_message_size: usize,
    pub max_frame_size: usize,
    /// Outbound queue depth between callers and the writer task
    pub send_queue: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_message_size: 64 * 1024,
            max_frame_size: 16 * 1024,
            send_queue: 64,
        }
    }
}

/// Meter sampling while a transaction is running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Cadence of MeterValues while charging
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Measurands sampled on every tick
    pub measurands: Vec<Measurand>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            measurands: vec![
                Measurand::EnergyActiveImportRegister,
                Measurand::PowerActiveImport,
            ],
        }
    }
}

/// Application-defined completion conditions for a charging session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChargeLimits {
    /// Stop once this much energy has been delivered
    pub energy_wh: Option<i32>,
    /// Stop after this long in Charging
    #[serde(with = "duration_ms::option")]
    pub duration: Option<Duration>,
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub identity: ChargePointIdentity,
    pub endpoint: CentralSystemEndpoint,
    pub transport: TransportConfig,

    /// Default deadline for outbound calls made by the engine itself
    #[serde(with = "duration_ms")]
    pub call_timeout: Duration,
    /// Used until BootNotification supplies an interval
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Retry delay for a Pending boot that carries no interval
    #[serde(with = "duration_ms")]
    pub boot_retry_interval: Duration,
    /// Initial reconnect delay
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Exponential backoff cap
    #[serde(with = "duration_ms")]
    pub max_reconnect_delay: Duration,

    pub authorize_retry: RetryPolicy,
    pub meter: MeterConfig,
    pub limits: ChargeLimits,

    /// Capacity of the engine event channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            identity: ChargePointIdentity::default(),
            endpoint: CentralSystemEndpoint::default(),
            transport: TransportConfig::default(),
            call_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(300),
            boot_retry_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            authorize_retry: RetryPolicy::default(),
            meter: MeterConfig::default(),
            limits: ChargeLimits::default(),
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn new(identity: ChargePointIdentity, endpoint: CentralSystemEndpoint) -> Self {
        Self {
            identity,
            endpoint,
            ..Default::default()
        }
    }

    /// Parse a JSON configuration document; missing fields keep defaults
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    pub fn with_authorize_retry(mut self, policy: RetryPolicy) -> Self {
        self.authorize_retry = policy;
        self
    }

    pub fn with_meter_interval(mut self, interval: Duration) -> Self {
        self.meter.interval = interval;
        self
    }

    pub fn with_measurands(mut self, measurands: Vec<Measurand>) -> Self {
        self.meter.measurands = measurands;
        self
    }

    pub fn with_limits(mut self, limits: ChargeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Check the configuration before the engine starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.connector_count == 0 {
            return Err(ConfigError::NoConnectors);
        }
        if self.identity.vendor.is_empty() || self.identity.model.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        let durations = [
            ("call_timeout", self.call_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("boot_retry_interval", self.boot_retry_interval),
            ("reconnect_delay", self.reconnect_delay),
            ("meter.interval", self.meter.interval),
            ("transport.connect_timeout", self.transport.connect_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.authorize_retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        Ok(())
    }
}

/// Serde helpers writing `Duration` as integer milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
