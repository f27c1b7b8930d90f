// relay-protocol: Redfish event-envelope and bus-record types.
//
// The inbound envelope mirrors the loosely-typed JSON that BMCs push; the
// outbound records are the three fixed families published to the bus.  All
// envelope fields are optional except `Events` -- the classifier and the
// worker lanes decide what a missing field means per family.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inbound event envelope
// ---------------------------------------------------------------------------

/// Top-level payload pushed by a managed endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "Events")]
    pub events: Vec<RedfishEvent>,
}

/// One event inside an envelope.
///
/// Only `MessageId` is required; everything else depends on the event
/// family.  Unknown fields are ignored on deserialization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RedfishEvent {
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "EventTimestamp", default)]
    pub event_timestamp: Option<String>,
    #[serde(rename = "Severity", default)]
    pub severity: Option<String>,
    #[serde(rename = "Message", default)]
    pub message: Option<String>,
    #[serde(rename = "OriginOfCondition", default)]
    pub origin_of_condition: Option<OriginOfCondition>,
    #[serde(rename = "Oem", default)]
    pub oem: Option<Oem>,
}

/// Nested origin reference; only the resource id is carried.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OriginOfCondition {
    #[serde(rename = "@odata.id", default)]
    pub odata_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Oem {
    #[serde(rename = "Sensors", default)]
    pub sensors: Option<Vec<OemSensor>>,
}

/// A sensor sample inside `Oem.Sensors`.
///
/// `Value` arrives as a JSON number for telemetry and as a string for
/// fabric-health events, so it is kept as a raw JSON value with typed
/// accessors.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OemSensor {
    #[serde(rename = "Location", default)]
    pub location: Option<String>,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<String>,
    #[serde(rename = "Value", default)]
    pub value: Option<serde_json::Value>,
    #[serde(rename = "ParentalContext", default)]
    pub parental_context: Option<String>,
    #[serde(rename = "ParentalIndex", default)]
    pub parental_index: Option<i64>,
    #[serde(rename = "PhysicalContext", default)]
    pub physical_context: Option<String>,
    #[serde(rename = "Index", default)]
    pub index: Option<i64>,
    #[serde(rename = "DeviceSpecificContext", default)]
    pub device_specific_context: Option<String>,
    #[serde(rename = "PhysicalSubContext", default)]
    pub physical_sub_context: Option<String>,
    #[serde(rename = "SubIndex", default)]
    pub sub_index: Option<i64>,
}

impl OemSensor {
    /// Numeric reading, accepting either a JSON number or a numeric string.
    pub fn value_f64(&self) -> Option<f64> {
        match self.value.as_ref()? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// String reading (fabric-health carries its message here).
    pub fn value_string(&self) -> Option<String> {
        match self.value.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// MessageId prefix that marks a telemetry event on the redfish path.
pub const TELEMETRY_PREFIX: &str = "CrayTelemetry.";

/// MessageId prefix that marks a fabric-health event on the slingshot path.
pub const FABRIC_HEALTH_PREFIX: &str = "CrayFabricHealth";

/// The ingest path a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestPath {
    Redfish,
    Slingshot,
}

impl IngestPath {
    /// Recognize a request path; anything else is dropped by the lane.
    pub fn from_request_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/redfish" => Some(IngestPath::Redfish),
            "/slingshot" => Some(IngestPath::Slingshot),
            _ => None,
        }
    }
}

/// Event family after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFamily {
    /// `CrayTelemetry.*` on the redfish path.
    Telemetry,
    /// Any other MessageId on the redfish path.
    Generic,
    /// `CrayFabricHealth*` on the slingshot path.
    FabricHealth,
    /// Recognized path but no matching family; dropped with a debug log.
    Unclassified,
}

/// Classify one event by ingest path and MessageId prefix.
pub fn classify(path: IngestPath, message_id: &str) -> EventFamily {
    match path {
        IngestPath::Redfish => {
            if message_id.starts_with(TELEMETRY_PREFIX) {
                EventFamily::Telemetry
            } else {
                EventFamily::Generic
            }
        }
        IngestPath::Slingshot => {
            if message_id.starts_with(FABRIC_HEALTH_PREFIX) {
                EventFamily::FabricHealth
            } else {
                EventFamily::Unclassified
            }
        }
    }
}

/// Event name of a telemetry MessageId: the part after `CrayTelemetry.`.
///
/// Non-telemetry ids are returned whole.
pub fn telemetry_event_name(message_id: &str) -> &str {
    message_id
        .strip_prefix(TELEMETRY_PREFIX)
        .unwrap_or(message_id)
}

/// Map a Redfish severity to a syslog level.
///
/// Unknown or missing severities map to `"unknown"`.
pub fn syslog_level(severity: &str) -> &'static str {
    match severity {
        "OK" => "information",
        "Warning" => "warning",
        "Critical" => "error",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Subscription wire types (management protocol)
// ---------------------------------------------------------------------------

/// A subscription this relay wants to exist on an endpoint.
///
/// The context is the identity key; list fields are compared sorted with a
/// missing field equivalent to an empty list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DesiredSubscription {
    #[serde(rename = "Destination")]
    pub destination: String,
    #[serde(rename = "Context")]
    pub context: String,
    #[serde(rename = "RegistryPrefixes", skip_serializing_if = "Vec::is_empty")]
    pub registry_prefixes: Vec<String>,
    #[serde(
        rename = "ExcludeRegistryPrefixes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub exclude_registry_prefixes: Vec<String>,
    #[serde(rename = "MessageIds", skip_serializing_if = "Vec::is_empty")]
    pub message_ids: Vec<String>,
    #[serde(rename = "ExcludeMessageIds", skip_serializing_if = "Vec::is_empty")]
    pub exclude_message_ids: Vec<String>,
    #[serde(rename = "Protocol")]
    pub protocol: String,
}

impl DesiredSubscription {
    /// A plain Redfish subscription with only destination + context set.
    pub fn new(destination: impl Into<String>, context: impl Into<String>) -> Self {
        DesiredSubscription {
            destination: destination.into(),
            context: context.into(),
            registry_prefixes: Vec::new(),
            exclude_registry_prefixes: Vec::new(),
            message_ids: Vec::new(),
            exclude_message_ids: Vec::new(),
            protocol: "Redfish".to_owned(),
        }
    }
}

/// A subscription as listed from an endpoint, with its server-assigned
/// handle (the resource's odata id) used for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveSubscription {
    #[serde(rename = "@odata.id", default)]
    pub handle: String,
    #[serde(rename = "Destination", default)]
    pub destination: String,
    #[serde(rename = "Context", default)]
    pub context: String,
    #[serde(rename = "RegistryPrefixes", default)]
    pub registry_prefixes: Vec<String>,
    #[serde(rename = "ExcludeRegistryPrefixes", default)]
    pub exclude_registry_prefixes: Vec<String>,
    #[serde(rename = "MessageIds", default)]
    pub message_ids: Vec<String>,
    #[serde(rename = "ExcludeMessageIds", default)]
    pub exclude_message_ids: Vec<String>,
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
}

// ---------------------------------------------------------------------------
// Outbound bus records
// ---------------------------------------------------------------------------

/// One deduplicated sensor sample, published to `<prefix>craytelemetry`.
///
/// Field names match the `RedfishCrayOemSensors` schema exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Milliseconds since epoch, skew-corrected.
    pub timestamp: i64,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Index")]
    pub index: i32,
    #[serde(rename = "ParentalContext")]
    pub parental_context: String,
    #[serde(rename = "ParentalIndex")]
    pub parental_index: i32,
    #[serde(rename = "PhysicalContext")]
    pub physical_context: String,
    #[serde(rename = "PhysicalSubContext")]
    pub physical_sub_context: String,
    #[serde(rename = "DeviceSpecificContext")]
    pub device_specific_context: String,
    #[serde(rename = "EventName")]
    pub event_name: String,
    #[serde(rename = "Value")]
    pub value: f64,
    #[serde(rename = "SensorName")]
    pub sensor_name: String,
    pub cluster: String,
}

/// One generic event, published to `<prefix>crayevents`.
///
/// Field names match the `RedfishCrayEvents` schema exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: i64,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    #[serde(rename = "Severity")]
    pub severity: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "OriginOfCondition")]
    pub origin_of_condition: String,
    pub syslog_level: String,
    pub cluster: String,
}

/// One fabric-health event, published to `crayfabrichealth`.
///
/// Field names match the `CrayFabricHealth` schema exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: i64,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "MessageId")]
    pub message_id: String,
    pub message: String,
    #[serde(rename = "Group")]
    pub group: i32,
    #[serde(rename = "Switch")]
    pub switch: i32,
    #[serde(rename = "Port")]
    pub port: i32,
    #[serde(rename = "Severity")]
    pub severity: String,
    #[serde(rename = "PhysicalContext")]
    pub physical_context: String,
    pub cluster: String,
}
