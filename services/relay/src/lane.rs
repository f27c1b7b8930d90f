//! Worker lanes: decode, classify, sample, dedup, emit.
//!
//! Each lane owns its input channel, its bus sink, and its per-client
//! sampling state, so processing needs no locks.  Sticky dispatch in the
//! listener guarantees all payloads from one client land on one lane,
//! which is what makes the lane-local sampling state correct.

use crate::alerts::AlertsLog;
use crate::config::SampleMode;
use crate::producer::{BusRecord, RecordSink, Topics};
use crate::resolver::HostResolver;
use relay_protocol::{
    classify, syslog_level, telemetry_event_name, EventEnvelope, EventFamily, EventRecord,
    HealthRecord, IngestPath, OemSensor, RedfishEvent, TelemetryRecord,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Sample timestamps further than this from wall clock are replaced.
pub const CLOCK_SKEW_LIMIT_SEC: i64 = 300;

/// Sampling-state entries above this count trigger an age-based sweep.
const SAMPLE_STATE_MAX: usize = 4096;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Work delivered to a lane by the listener.
///
/// The path is kept raw; recognizing it is part of the decode step.
#[derive(Debug)]
pub enum Job {
    Payload {
        path: String,
        client_ip: String,
        body: Vec<u8>,
    },
    /// Drain the sink and return.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Decode error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("JSON parse: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Per-source sampling
// ---------------------------------------------------------------------------

#[derive(Debug, Hash, PartialEq, Eq)]
struct SampleKey {
    client: String,
    /// None in per-client mode.
    message_id: Option<String>,
}

/// Tracks the monotonic time of the last accepted telemetry event per
/// source.  Unbounded growth is capped by an age sweep once the map
/// passes `SAMPLE_STATE_MAX` entries.
pub struct Sampler {
    period: Duration,
    mode: SampleMode,
    last_accepted: HashMap<SampleKey, Instant>,
}

impl Sampler {
    pub fn new(period: Duration, mode: SampleMode) -> Self {
        Sampler {
            period,
            mode,
            last_accepted: HashMap::new(),
        }
    }

    /// Whether to accept an event arriving `now`; updates state on accept.
    pub fn accept(&mut self, client_ip: &str, message_id: &str, now: Instant) -> bool {
        if self.period.is_zero() {
            return true;
        }
        let key = SampleKey {
            client: client_ip.to_owned(),
            message_id: match self.mode {
                SampleMode::PerMessageId => Some(message_id.to_owned()),
                SampleMode::PerClient => None,
            },
        };
        match self.last_accepted.get(&key) {
            Some(last) if now.duration_since(*last) < self.period => false,
            _ => {
                self.last_accepted.insert(key, now);
                true
            }
        }
    }

    /// Drop entries idle for a day once the map grows past the cap.
    pub fn reap(&mut self, now: Instant) {
        if self.last_accepted.len() > SAMPLE_STATE_MAX {
            self.last_accepted
                .retain(|_, last| now.duration_since(*last) < DAY);
        }
    }
}

// ---------------------------------------------------------------------------
// Skew-safe time parsing
// ---------------------------------------------------------------------------

/// Throttles clock-skew warnings to one per source per day.
pub struct SkewThrottle {
    last_warned: HashMap<String, Instant>,
}

impl SkewThrottle {
    pub fn new() -> Self {
        SkewThrottle {
            last_warned: HashMap::new(),
        }
    }

    fn should_warn(&mut self, source: &str, now: Instant) -> bool {
        match self.last_warned.get(source) {
            Some(last) if now.duration_since(*last) < DAY => false,
            _ => {
                self.last_warned.insert(source.to_owned(), now);
                true
            }
        }
    }
}

/// Parse an ISO-8601 timestamp to milliseconds since epoch.
///
/// Zone-less timestamps are read as UTC (some BMC firmware omits the
/// suffix).
pub fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

// ---------------------------------------------------------------------------
// Payload processing
// ---------------------------------------------------------------------------

/// Pure-ish payload pipeline: everything a lane does between channel pop
/// and sink emit.  Holds the lane-local mutable state so it can be
/// exercised in tests without a bus.
pub struct PayloadProcessor {
    pub cluster: String,
    sampler: Sampler,
    skew: SkewThrottle,
}

impl PayloadProcessor {
    pub fn new(cluster: String, sample_period: Duration, sample_mode: SampleMode) -> Self {
        PayloadProcessor {
            cluster,
            sampler: Sampler::new(sample_period, sample_mode),
            skew: SkewThrottle::new(),
        }
    }

    /// Decode one payload and return the records to emit, in order.
    ///
    /// `location` is the resolved client name (used by generic events).
    /// Telemetry records are deduplicated across the whole payload:
    /// exactly one record per distinct SensorName survives, the one with
    /// the largest sample timestamp, first seen winning ties.
    pub fn process(
        &mut self,
        path: IngestPath,
        client_ip: &str,
        location: &str,
        body: &[u8],
        now_ms: i64,
        now: Instant,
    ) -> Result<Vec<BusRecord>, DecodeError> {
        let text = std::str::from_utf8(body)?;
        let envelope: EventEnvelope = serde_json::from_str(text)?;

        let mut records = Vec::new();
        let mut dedup: HashMap<String, TelemetryRecord> = HashMap::new();
        // Dedup insertion order, so tied timestamps keep first-seen.
        let mut dedup_order = Vec::new();

        for event in &envelope.events {
            match classify(path, &event.message_id) {
                EventFamily::Telemetry => {
                    if !self.sampler.accept(client_ip, &event.message_id, now) {
                        debug!(client = %client_ip, message_id = %event.message_id,
                            "telemetry event sampled out");
                        continue;
                    }
                    self.collect_telemetry(event, client_ip, now_ms, now, &mut dedup, &mut dedup_order);
                }
                EventFamily::Generic => {
                    if let Some(record) = self.generic_record(event, client_ip, location, now_ms, now)
                    {
                        records.push(BusRecord::Event(record));
                    }
                }
                EventFamily::FabricHealth => {
                    if let Some(record) = self.health_record(event, client_ip, now_ms, now) {
                        records.push(BusRecord::Health(record));
                    }
                }
                EventFamily::Unclassified => {
                    debug!(client = %client_ip, message_id = %event.message_id,
                        "unclassified event dropped");
                }
            }
        }

        for name in dedup_order {
            if let Some(record) = dedup.remove(&name) {
                records.push(BusRecord::Telemetry(record));
            }
        }

        self.sampler.reap(now);
        Ok(records)
    }

    fn collect_telemetry(
        &mut self,
        event: &RedfishEvent,
        client_ip: &str,
        now_ms: i64,
        now: Instant,
        dedup: &mut HashMap<String, TelemetryRecord>,
        dedup_order: &mut Vec<String>,
    ) {
        let Some(sensors) = event.oem.as_ref().and_then(|o| o.sensors.as_ref()) else {
            warn!(client = %client_ip, message_id = %event.message_id,
                "telemetry event without Oem.Sensors");
            return;
        };
        let event_name = telemetry_event_name(&event.message_id);

        for sensor in sensors {
            let (Some(location), Some(raw_ts), Some(value)) = (
                sensor.location.as_deref(),
                sensor.timestamp.as_deref(),
                sensor.value_f64(),
            ) else {
                warn!(client = %client_ip, message_id = %event.message_id,
                    "sensor missing Location/Timestamp/Value, skipped");
                continue;
            };

            let timestamp = self.skew_safe_ms(Some(raw_ts), client_ip, now_ms, now);

            let parental_context = sensor.parental_context.clone().unwrap_or_default();
            let parental_index = sensor.parental_index.unwrap_or(-1) as i32;
            let physical_context = sensor.physical_context.clone().unwrap_or_default();
            let index = sensor.index.unwrap_or(-1) as i32;
            let device_specific_context =
                sensor.device_specific_context.clone().unwrap_or_default();
            let physical_sub_context = sensor.physical_sub_context.clone().unwrap_or_default();

            let sensor_name = format!(
                "{}{}{}{}{}{}{}",
                parental_context,
                parental_index,
                physical_context,
                index,
                device_specific_context,
                physical_sub_context,
                event_name,
            );

            let record = TelemetryRecord {
                timestamp,
                location: location.to_owned(),
                index,
                parental_context,
                parental_index,
                physical_context,
                physical_sub_context,
                device_specific_context,
                event_name: event_name.to_owned(),
                value,
                sensor_name: sensor_name.clone(),
                cluster: self.cluster.clone(),
            };

            match dedup.get(&sensor_name) {
                Some(existing) if existing.timestamp >= record.timestamp => {}
                Some(_) => {
                    dedup.insert(sensor_name, record);
                }
                None => {
                    dedup_order.push(sensor_name.clone());
                    dedup.insert(sensor_name, record);
                }
            }
        }
    }

    fn generic_record(
        &mut self,
        event: &RedfishEvent,
        client_ip: &str,
        location: &str,
        now_ms: i64,
        now: Instant,
    ) -> Option<EventRecord> {
        let Some(raw_ts) = event.event_timestamp.as_deref() else {
            warn!(client = %client_ip, message_id = %event.message_id,
                "generic event without EventTimestamp, dropped");
            return None;
        };
        let timestamp = self.skew_safe_ms(Some(raw_ts), client_ip, now_ms, now);

        let severity = event.severity.clone().unwrap_or_default();
        Some(EventRecord {
            timestamp,
            location: location.to_owned(),
            message_id: event.message_id.clone(),
            syslog_level: syslog_level(&severity).to_owned(),
            severity,
            message: event.message.clone().unwrap_or_default(),
            origin_of_condition: event
                .origin_of_condition
                .as_ref()
                .and_then(|o| o.odata_id.clone())
                .unwrap_or_default(),
            cluster: self.cluster.clone(),
        })
    }

    fn health_record(
        &mut self,
        event: &RedfishEvent,
        client_ip: &str,
        now_ms: i64,
        now: Instant,
    ) -> Option<HealthRecord> {
        let Some(sensors) = event.oem.as_ref().and_then(|o| o.sensors.as_ref()) else {
            warn!(client = %client_ip, message_id = %event.message_id,
                "health event without Oem.Sensors, dropped");
            return None;
        };
        let Some(sensor) = sensors.first() else {
            warn!(client = %client_ip, message_id = %event.message_id,
                "health event with empty Oem.Sensors, dropped");
            return None;
        };
        if sensors.len() > 1 {
            // Multi-sensor health events are reserved; only the first counts.
            warn!(client = %client_ip, message_id = %event.message_id,
                count = sensors.len(), "health event with multiple sensors, using first");
        }

        let raw_ts = sensor
            .timestamp
            .as_deref()
            .or(event.event_timestamp.as_deref());
        let timestamp = self.skew_safe_ms(raw_ts, client_ip, now_ms, now);

        Some(HealthRecord {
            timestamp,
            location: sensor.location.clone().unwrap_or_default(),
            message_id: event.message_id.clone(),
            message: sensor.value_string().unwrap_or_default(),
            group: int_field(sensor, |s| s.parental_index),
            switch: int_field(sensor, |s| s.index),
            port: int_field(sensor, |s| s.sub_index),
            severity: sensor.physical_sub_context.clone().unwrap_or_default(),
            physical_context: sensor.physical_context.clone().unwrap_or_default(),
            cluster: self.cluster.clone(),
        })
    }

    /// Skew-safe parse: wall clock on parse failure (plain warn) or on
    /// implausible skew (warn throttled per source per day).
    fn skew_safe_ms(
        &mut self,
        raw: Option<&str>,
        source: &str,
        now_ms: i64,
        now: Instant,
    ) -> i64 {
        let Some(raw) = raw else {
            return now_ms;
        };
        match parse_timestamp_ms(raw) {
            None => {
                warn!(client = %source, timestamp = %raw,
                    "unparseable timestamp, using wall clock");
                now_ms
            }
            Some(parsed) => {
                if (parsed - now_ms).abs() > CLOCK_SKEW_LIMIT_SEC * 1000 {
                    if self.skew.should_warn(source, now) {
                        warn!(client = %source, parsed_ms = parsed,
                            "timestamp outside skew limit, using wall clock");
                    }
                    now_ms
                } else {
                    parsed
                }
            }
        }
    }
}

fn int_field(sensor: &OemSensor, get: impl Fn(&OemSensor) -> Option<i64>) -> i32 {
    get(sensor).unwrap_or(0) as i32
}

// ---------------------------------------------------------------------------
// Lane
// ---------------------------------------------------------------------------

/// One worker lane: channel consumer, payload processor, bus sink.
pub struct Lane {
    index: usize,
    rx: mpsc::Receiver<Job>,
    sink: Box<dyn RecordSink + Send>,
    resolver: Arc<HostResolver>,
    alerts: AlertsLog,
    topics: Topics,
    processor: PayloadProcessor,
}

impl Lane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        rx: mpsc::Receiver<Job>,
        sink: Box<dyn RecordSink + Send>,
        resolver: Arc<HostResolver>,
        alerts: AlertsLog,
        topics: Topics,
        processor: PayloadProcessor,
    ) -> Self {
        Lane {
            index,
            rx,
            sink,
            resolver,
            alerts,
            topics,
            processor,
        }
    }

    /// Consume jobs until shutdown (sentinel or closed channel), then
    /// drain the sink.
    pub async fn run(mut self) {
        info!(lane = self.index, "worker lane started");
        while let Some(job) = self.rx.recv().await {
            match job {
                Job::Shutdown => break,
                Job::Payload {
                    path,
                    client_ip,
                    body,
                } => {
                    self.handle(&path, &client_ip, &body).await;
                    self.sink.poll();
                }
            }
        }
        self.sink.flush();
        info!(lane = self.index, "worker lane stopped");
    }

    async fn handle(&mut self, path: &str, client_ip: &str, body: &[u8]) {
        let Some(ingest_path) = IngestPath::from_request_path(path) else {
            warn!(lane = self.index, client = %client_ip, path, "unknown ingest path, payload dropped");
            return;
        };

        let location = self.resolver.resolve(client_ip).await;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let records = match self.processor.process(
            ingest_path,
            client_ip,
            &location,
            body,
            now_ms,
            Instant::now(),
        ) {
            Ok(records) => records,
            Err(e) => {
                error!(lane = self.index, client = %client_ip, error = %e,
                    "malformed payload dropped");
                return;
            }
        };

        for record in records {
            let topic = match &record {
                BusRecord::Telemetry(_) => &self.topics.telemetry,
                BusRecord::Event(event) => {
                    self.alerts.record(event);
                    &self.topics.events
                }
                BusRecord::Health(_) => &self.topics.health,
            };
            let topic = topic.clone();
            self.sink.emit(&topic, None, &record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339_parses_to_millis() {
        assert_eq!(
            parse_timestamp_ms("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000)
        );
        assert_eq!(
            parse_timestamp_ms("2024-01-01T00:00:00.250Z"),
            Some(1_704_067_200_250)
        );
    }

    #[test]
    fn zoneless_timestamps_read_as_utc() {
        assert_eq!(
            parse_timestamp_ms("2024-01-01T00:00:00"),
            Some(1_704_067_200_000)
        );
    }

    #[test]
    fn garbage_timestamps_do_not_parse() {
        assert_eq!(parse_timestamp_ms("not-a-time"), None);
        assert_eq!(parse_timestamp_ms(""), None);
    }

    #[test]
    fn sampler_drops_inside_period_per_message_id() {
        let mut sampler = Sampler::new(Duration::from_secs(10), SampleMode::PerMessageId);
        let t0 = Instant::now();
        assert!(sampler.accept("10.0.0.1", "CrayTelemetry.Temperature", t0));
        assert!(!sampler.accept(
            "10.0.0.1",
            "CrayTelemetry.Temperature",
            t0 + Duration::from_secs(5)
        ));
        // A different message id has its own budget.
        assert!(sampler.accept("10.0.0.1", "CrayTelemetry.Voltage", t0 + Duration::from_secs(5)));
        // After the period, accepted again.
        assert!(sampler.accept(
            "10.0.0.1",
            "CrayTelemetry.Temperature",
            t0 + Duration::from_secs(11)
        ));
    }

    #[test]
    fn sampler_per_client_mode_shares_one_budget() {
        let mut sampler = Sampler::new(Duration::from_secs(10), SampleMode::PerClient);
        let t0 = Instant::now();
        assert!(sampler.accept("10.0.0.1", "CrayTelemetry.Temperature", t0));
        assert!(!sampler.accept(
            "10.0.0.1",
            "CrayTelemetry.Voltage",
            t0 + Duration::from_secs(5)
        ));
    }

    #[test]
    fn zero_period_disables_sampling() {
        let mut sampler = Sampler::new(Duration::ZERO, SampleMode::PerMessageId);
        let t0 = Instant::now();
        assert!(sampler.accept("10.0.0.1", "m", t0));
        assert!(sampler.accept("10.0.0.1", "m", t0));
    }

    #[test]
    fn skew_warning_throttles_per_source() {
        let mut throttle = SkewThrottle::new();
        let t0 = Instant::now();
        assert!(throttle.should_warn("10.0.0.1", t0));
        assert!(!throttle.should_warn("10.0.0.1", t0 + Duration::from_secs(60)));
        assert!(throttle.should_warn("10.0.0.2", t0));
        assert!(throttle.should_warn("10.0.0.1", t0 + DAY + Duration::from_secs(1)));
    }
}
