//! Bus record schemas and registry-aware binary encoding.
//!
//! Each of the three record families owns an Avro schema.  At sink
//! construction the schemas are registered with the schema registry
//! under `<topic>-value` (registration is idempotent; re-registering an
//! identical schema returns the existing id), and records are encoded in
//! the registry wire format: magic byte `0x00`, big-endian 4-byte schema
//! id, then the binary datum.

use apache_avro::Schema;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

pub const TELEMETRY_SCHEMA: &str = r#"{
    "type": "record",
    "name": "RedfishCrayOemSensors",
    "fields": [
        {"name": "timestamp", "type": "long"},
        {"name": "Location", "type": "string"},
        {"name": "Index", "type": "int"},
        {"name": "ParentalContext", "type": "string"},
        {"name": "ParentalIndex", "type": "int"},
        {"name": "PhysicalContext", "type": "string"},
        {"name": "PhysicalSubContext", "type": "string"},
        {"name": "DeviceSpecificContext", "type": "string"},
        {"name": "EventName", "type": "string"},
        {"name": "Value", "type": "double"},
        {"name": "SensorName", "type": "string"},
        {"name": "cluster", "type": "string"}
    ]
}"#;

pub const EVENTS_SCHEMA: &str = r#"{
    "type": "record",
    "name": "RedfishCrayEvents",
    "fields": [
        {"name": "timestamp", "type": "long"},
        {"name": "Location", "type": "string"},
        {"name": "MessageId", "type": "string"},
        {"name": "Severity", "type": "string"},
        {"name": "Message", "type": "string"},
        {"name": "OriginOfCondition", "type": "string"},
        {"name": "syslog_level", "type": "string"},
        {"name": "cluster", "type": "string"}
    ]
}"#;

pub const HEALTH_SCHEMA: &str = r#"{
    "type": "record",
    "name": "CrayFabricHealth",
    "fields": [
        {"name": "timestamp", "type": "long"},
        {"name": "Location", "type": "string"},
        {"name": "MessageId", "type": "string"},
        {"name": "message", "type": "string"},
        {"name": "Group", "type": "int"},
        {"name": "Switch", "type": "int"},
        {"name": "Port", "type": "int"},
        {"name": "Severity", "type": "string"},
        {"name": "PhysicalContext", "type": "string"},
        {"name": "cluster", "type": "string"}
    ]
}"#;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Avro: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error("registry: {0}")]
    Registry(String),
}

// ---------------------------------------------------------------------------
// Compiled schema + registry id
// ---------------------------------------------------------------------------

/// A compiled schema bound to its registry-assigned id.
pub struct RegisteredSchema {
    schema: Schema,
    id: u32,
}

impl RegisteredSchema {
    /// Compile a schema without registry involvement (id 0).
    ///
    /// Used by the no-bus sink and by tests; the wire framing still
    /// applies so round-trip tests exercise the real encoder.
    pub fn unregistered(schema_json: &str) -> Result<Self, SchemaError> {
        Ok(RegisteredSchema {
            schema: Schema::parse_str(schema_json)?,
            id: 0,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Encode a record in registry wire framing.
    pub fn encode<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, SchemaError> {
        let value = apache_avro::to_value(record)?;
        let datum = apache_avro::to_avro_datum(&self.schema, value)?;

        let mut framed = Vec::with_capacity(5 + datum.len());
        framed.push(0u8);
        framed.extend_from_slice(&self.id.to_be_bytes());
        framed.extend_from_slice(&datum);
        Ok(framed)
    }
}

// ---------------------------------------------------------------------------
// Schema registry client
// ---------------------------------------------------------------------------

/// Minimal schema-registry client: register a schema under a subject and
/// learn its id.  Construction is the only time the registry is needed;
/// encoding afterwards is offline.
pub struct SchemaRegistry {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct RegisterResponse {
    id: u32,
}

impl SchemaRegistry {
    /// Build a client from the opaque `[schema_registry]` config table.
    ///
    /// Recognized keys: `url` (required), `timeout` (seconds).
    pub fn from_config(config: &HashMap<String, String>) -> Result<Self, SchemaError> {
        let base_url = config
            .get("url")
            .cloned()
            .ok_or_else(|| SchemaError::Registry("schema_registry.url is not set".to_owned()))?;
        let timeout = config
            .get("timeout")
            .and_then(|t| t.parse().ok())
            .unwrap_or(10);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| SchemaError::Registry(e.to_string()))?;

        Ok(SchemaRegistry {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Register `schema_json` under `<topic>-value` and return the bound
    /// schema.
    pub async fn register(
        &self,
        topic: &str,
        schema_json: &str,
    ) -> Result<RegisteredSchema, SchemaError> {
        let schema = Schema::parse_str(schema_json)?;
        let url = format!("{}/subjects/{}-value/versions", self.base_url, topic);
        let body = serde_json::json!({ "schema": schema_json });

        let response = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/vnd.schemaregistry.v1+json",
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| SchemaError::Registry(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SchemaError::Registry(format!(
                "subject {}-value: HTTP {}: {}",
                topic, status, detail
            )));
        }

        let parsed: RegisterResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::Registry(format!("registry response: {}", e)))?;

        Ok(RegisteredSchema {
            schema,
            id: parsed.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{EventRecord, HealthRecord, TelemetryRecord};

    #[test]
    fn all_three_schemas_compile() {
        for json in [TELEMETRY_SCHEMA, EVENTS_SCHEMA, HEALTH_SCHEMA] {
            RegisteredSchema::unregistered(json).expect("schema should compile");
        }
    }

    #[test]
    fn telemetry_record_round_trips() {
        let registered = RegisteredSchema::unregistered(TELEMETRY_SCHEMA).unwrap();
        let record = TelemetryRecord {
            timestamp: 1_704_067_200_000,
            location: "x1000c0s0b0".to_owned(),
            index: 1,
            parental_context: "Chassis".to_owned(),
            parental_index: 0,
            physical_context: "CPU".to_owned(),
            physical_sub_context: "Input".to_owned(),
            device_specific_context: "Core".to_owned(),
            event_name: "Temperature".to_owned(),
            value: 42.5,
            sensor_name: "Chassis0CPU1CoreInputTemperature".to_owned(),
            cluster: "relay".to_owned(),
        };

        let framed = registered.encode(&record).expect("encode");
        assert_eq!(framed[0], 0, "magic byte");
        assert_eq!(&framed[1..5], &0u32.to_be_bytes(), "schema id");

        let mut datum = &framed[5..];
        let value = apache_avro::from_avro_datum(registered.schema(), &mut datum, None)
            .expect("decode datum");
        let decoded: TelemetryRecord = apache_avro::from_value(&value).expect("from value");
        assert_eq!(decoded, record);
    }

    #[test]
    fn event_record_round_trips() {
        let registered = RegisteredSchema::unregistered(EVENTS_SCHEMA).unwrap();
        let record = EventRecord {
            timestamp: 1_704_067_200_000,
            location: "x3000c0s1b0".to_owned(),
            message_id: "Foo.Bar".to_owned(),
            severity: "Critical".to_owned(),
            message: "m".to_owned(),
            origin_of_condition: "/x".to_owned(),
            syslog_level: "error".to_owned(),
            cluster: "relay".to_owned(),
        };

        let framed = registered.encode(&record).expect("encode");
        let mut datum = &framed[5..];
        let value =
            apache_avro::from_avro_datum(registered.schema(), &mut datum, None).expect("decode");
        let decoded: EventRecord = apache_avro::from_value(&value).expect("from value");
        assert_eq!(decoded, record);
    }

    #[test]
    fn health_record_round_trips() {
        let registered = RegisteredSchema::unregistered(HEALTH_SCHEMA).unwrap();
        let record = HealthRecord {
            timestamp: 1_704_067_200_000,
            location: "s0".to_owned(),
            message_id: "CrayFabricHealth.LinkDown".to_owned(),
            message: "link down".to_owned(),
            group: 2,
            switch: 4,
            port: 11,
            severity: "Warning".to_owned(),
            physical_context: "Fabric".to_owned(),
            cluster: "relay".to_owned(),
        };

        let framed = registered.encode(&record).expect("encode");
        let mut datum = &framed[5..];
        let value =
            apache_avro::from_avro_datum(registered.schema(), &mut datum, None).expect("decode");
        let decoded: HealthRecord = apache_avro::from_value(&value).expect("from value");
        assert_eq!(decoded, record);
    }
}
