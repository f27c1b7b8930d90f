//! Bus producer: schema-aware encoding and asynchronous publishing.
//!
//! Each worker lane owns one sink.  `emit` is non-blocking: the encoded
//! record goes onto the client's outbound queue and the delivery result
//! arrives later through the producer context, which logs failures at
//! error and successes at trace.  `poll` services those callbacks and
//! must run between payloads; `flush` drains the queue at shutdown.

use crate::config::RelayConfig;
use crate::schema::{
    RegisteredSchema, SchemaError, SchemaRegistry, EVENTS_SCHEMA, HEALTH_SCHEMA, TELEMETRY_SCHEMA,
};
use rdkafka::config::ClientConfig;
use rdkafka::message::Message;
use rdkafka::producer::{BaseProducer, BaseRecord, Producer, ProducerContext};
use rdkafka::ClientContext;
use std::time::Duration;
use tracing::{debug, error, trace};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Resolved topic names for the three record families.
///
/// The health topic name is fixed; its consumers predate the prefix
/// convention.
#[derive(Debug, Clone)]
pub struct Topics {
    pub telemetry: String,
    pub events: String,
    pub health: String,
}

impl Topics {
    pub fn from_prefix(prefix: &str) -> Self {
        Topics {
            telemetry: format!("{}craytelemetry", prefix),
            events: format!("{}crayevents", prefix),
            health: "crayfabrichealth".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A record tagged with its family, ready for schema-aware encoding.
#[derive(Debug, Clone)]
pub enum BusRecord {
    Telemetry(relay_protocol::TelemetryRecord),
    Event(relay_protocol::EventRecord),
    Health(relay_protocol::HealthRecord),
}

// ---------------------------------------------------------------------------
// Sink trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),
}

/// The lane-facing producer seam.
///
/// Implementations swallow per-record errors after logging them: a bad
/// record or a failed delivery never stops the pipeline.
pub trait RecordSink: Send {
    /// Schedule one record for delivery.
    fn emit(&mut self, topic: &str, key: Option<&str>, record: &BusRecord);
    /// Service delivery callbacks.
    fn poll(&mut self);
    /// Drain pending submissions (shutdown path).
    fn flush(&mut self);
}

/// Build the sink configured for this process.
pub async fn build_sink(
    config: &RelayConfig,
    topics: &Topics,
) -> Result<Box<dyn RecordSink + Send>, SinkError> {
    if config.general.no_kafka {
        return Ok(Box::new(NullSink));
    }

    let registry = SchemaRegistry::from_config(&config.schema_registry)?;
    let telemetry = registry.register(&topics.telemetry, TELEMETRY_SCHEMA).await?;
    let events = registry.register(&topics.events, EVENTS_SCHEMA).await?;
    let health = registry.register(&topics.health, HEALTH_SCHEMA).await?;

    let mut client_config = ClientConfig::new();
    for (key, value) in &config.kafka {
        client_config.set(key, value);
    }
    let producer: BaseProducer<DeliveryLogger> =
        client_config.create_with_context(DeliveryLogger)?;

    Ok(Box::new(KafkaSink {
        producer,
        telemetry,
        events,
        health,
    }))
}

// ---------------------------------------------------------------------------
// Kafka sink
// ---------------------------------------------------------------------------

/// Logs delivery outcomes from the producer's callback thread context.
struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(
        &self,
        delivery_result: &rdkafka::producer::DeliveryResult<'_>,
        _delivery_opaque: Self::DeliveryOpaque,
    ) {
        match delivery_result {
            Ok(message) => trace!(topic = message.topic(), "record delivered"),
            Err((e, message)) => {
                // No retry here: the bus client owns redelivery policy.
                error!(topic = message.topic(), error = %e, "bus delivery failed");
            }
        }
    }
}

pub struct KafkaSink {
    producer: BaseProducer<DeliveryLogger>,
    telemetry: RegisteredSchema,
    events: RegisteredSchema,
    health: RegisteredSchema,
}

impl KafkaSink {
    fn schema_for(&self, record: &BusRecord) -> &RegisteredSchema {
        match record {
            BusRecord::Telemetry(_) => &self.telemetry,
            BusRecord::Event(_) => &self.events,
            BusRecord::Health(_) => &self.health,
        }
    }

    fn encode(&self, record: &BusRecord) -> Result<Vec<u8>, SchemaError> {
        let schema = self.schema_for(record);
        match record {
            BusRecord::Telemetry(r) => schema.encode(r),
            BusRecord::Event(r) => schema.encode(r),
            BusRecord::Health(r) => schema.encode(r),
        }
    }
}

impl RecordSink for KafkaSink {
    fn emit(&mut self, topic: &str, key: Option<&str>, record: &BusRecord) {
        let payload = match self.encode(record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(topic, error = %e, "record failed schema encoding, dropped");
                return;
            }
        };

        let mut base = BaseRecord::<str, Vec<u8>>::to(topic).payload(&payload);
        if let Some(k) = key {
            base = base.key(k);
        }
        if let Err((e, _)) = self.producer.send(base) {
            error!(topic, error = %e, "record rejected by producer queue, dropped");
        }
    }

    fn poll(&mut self) {
        self.producer.poll(Duration::from_millis(0));
    }

    fn flush(&mut self) {
        if let Err(e) = self.producer.flush(Duration::from_secs(10)) {
            error!(error = %e, "flush did not drain the producer queue");
        }
    }
}

// ---------------------------------------------------------------------------
// Null sink (no_kafka)
// ---------------------------------------------------------------------------

/// Stands in for the bus when `no_kafka` is set; every emission is a
/// debug log line.
pub struct NullSink;

impl RecordSink for NullSink {
    fn emit(&mut self, topic: &str, _key: Option<&str>, record: &BusRecord) {
        debug!(topic, ?record, "bus disabled, record dropped");
    }

    fn poll(&mut self) {}

    fn flush(&mut self) {}
}
