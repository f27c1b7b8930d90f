/// Envelope deserialization and classification tests against realistic
/// BMC payloads.
use relay_protocol::{
    classify, syslog_level, telemetry_event_name, EventEnvelope, EventFamily, IngestPath,
};

#[test]
fn telemetry_envelope_deserializes() {
    let json = r#"{
        "Events": [{
            "MessageId": "CrayTelemetry.Temperature",
            "Oem": {
                "Sensors": [{
                    "Location": "x1000c0s0b0",
                    "Timestamp": "2024-01-01T00:00:00Z",
                    "Value": 42.5,
                    "ParentalContext": "Chassis",
                    "ParentalIndex": 0,
                    "PhysicalContext": "CPU",
                    "Index": 1,
                    "DeviceSpecificContext": "Core",
                    "PhysicalSubContext": "Input"
                }]
            }
        }]
    }"#;
    let env: EventEnvelope = serde_json::from_str(json).expect("envelope should parse");
    assert_eq!(env.events.len(), 1);
    let event = &env.events[0];
    assert_eq!(event.message_id, "CrayTelemetry.Temperature");
    let sensors = event
        .oem
        .as_ref()
        .and_then(|o| o.sensors.as_ref())
        .expect("sensors present");
    assert_eq!(sensors.len(), 1);
    assert_eq!(sensors[0].value_f64(), Some(42.5));
    assert_eq!(sensors[0].location.as_deref(), Some("x1000c0s0b0"));
    assert_eq!(sensors[0].parental_index, Some(0));
}

#[test]
fn generic_event_envelope_deserializes() {
    let json = r#"{
        "Events": [{
            "MessageId": "Foo.Bar",
            "EventTimestamp": "2024-01-01T00:00:00Z",
            "Severity": "Critical",
            "Message": "m",
            "OriginOfCondition": {"@odata.id": "/x"}
        }]
    }"#;
    let env: EventEnvelope = serde_json::from_str(json).expect("envelope should parse");
    let event = &env.events[0];
    assert_eq!(event.severity.as_deref(), Some("Critical"));
    assert_eq!(
        event
            .origin_of_condition
            .as_ref()
            .and_then(|o| o.odata_id.as_deref()),
        Some("/x")
    );
}

#[test]
fn envelope_without_events_is_rejected() {
    let result: Result<EventEnvelope, _> = serde_json::from_str(r#"{"Foo": []}"#);
    assert!(result.is_err());
}

#[test]
fn string_sensor_value_is_readable_both_ways() {
    let json = r#"{
        "Events": [{
            "MessageId": "CrayFabricHealth.LinkDown",
            "Oem": {"Sensors": [{"Location": "s0", "Value": "link down"}]}
        }]
    }"#;
    let env: EventEnvelope = serde_json::from_str(json).unwrap();
    let sensor = &env.events[0].oem.as_ref().unwrap().sensors.as_ref().unwrap()[0];
    assert_eq!(sensor.value_string().as_deref(), Some("link down"));
    assert_eq!(sensor.value_f64(), None);
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn redfish_path_splits_telemetry_from_generic() {
    assert_eq!(
        classify(IngestPath::Redfish, "CrayTelemetry.Voltage"),
        EventFamily::Telemetry
    );
    assert_eq!(
        classify(IngestPath::Redfish, "Alert.1.0.PowerSupplyFailure"),
        EventFamily::Generic
    );
}

#[test]
fn slingshot_path_accepts_only_fabric_health() {
    assert_eq!(
        classify(IngestPath::Slingshot, "CrayFabricHealth.LinkDown"),
        EventFamily::FabricHealth
    );
    assert_eq!(
        classify(IngestPath::Slingshot, "CrayTelemetry.Temperature"),
        EventFamily::Unclassified
    );
}

#[test]
fn request_paths_are_recognized() {
    assert_eq!(
        IngestPath::from_request_path("/redfish"),
        Some(IngestPath::Redfish)
    );
    assert_eq!(
        IngestPath::from_request_path("/slingshot/"),
        Some(IngestPath::Slingshot)
    );
    assert_eq!(IngestPath::from_request_path("/other"), None);
}

#[test]
fn event_name_strips_telemetry_prefix() {
    assert_eq!(telemetry_event_name("CrayTelemetry.Temperature"), "Temperature");
    assert_eq!(telemetry_event_name("Foo.Bar"), "Foo.Bar");
}

#[test]
fn severity_maps_to_syslog_levels() {
    assert_eq!(syslog_level("OK"), "information");
    assert_eq!(syslog_level("Warning"), "warning");
    assert_eq!(syslog_level("Critical"), "error");
    assert_eq!(syslog_level("Bogus"), "unknown");
}
