/// Integration tests for relay config loading: defaults, required-field
/// validation, hostlist expansion, and desired-state derivation.
use relay::config::{load_config_from_str, SampleMode};

const MINIMAL: &str = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "foo-cmm[1-2]"
context = "dftfsub_all"
"#;

#[test]
fn minimal_config_loads_with_defaults() {
    let cfg = load_config_from_str(MINIMAL).expect("should load");
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.refresh_interval, 600);
    assert_eq!(cfg.general.context_prefix, "dftfsub_");
    assert_eq!(cfg.general.topic_prefix, "redfish-");
    assert_eq!(cfg.general.sample_period, 10);
    assert_eq!(cfg.general.sample_mode, SampleMode::PerMessageId);
    assert_eq!(cfg.general.worker_count, 4);
    assert_eq!(cfg.general.port, 9127);
    assert!(!cfg.general.purge_unrecognized);
    assert!(!cfg.general.no_kafka);

    assert_eq!(cfg.entries.len(), 1);
    assert_eq!(cfg.entries[0].servers, vec!["foo-cmm1", "foo-cmm2"]);
}

#[test]
fn empty_config_is_valid_ingest_only() {
    // No subscriptions: pure ingest instance, credentials not required.
    let cfg = load_config_from_str("").expect("should load");
    assert!(cfg.entries.is_empty());
}

#[test]
fn subscriptions_require_credentials() {
    let toml = r#"
[[subscription]]
servers = "foo"
context = "dftfsub_all"
"#;
    assert!(load_config_from_str(toml).is_err());
}

#[test]
fn context_must_carry_the_namespace_prefix() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "foo"
context = "other_tool"
"#;
    let result = load_config_from_str(toml);
    assert!(result.is_err(), "foreign context prefix must be rejected");
}

#[test]
fn custom_context_prefix_is_honored() {
    let toml = r#"
[general]
context_prefix = "sitesub_"
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "foo"
context = "sitesub_all"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.entries[0].context, "sitesub_all");
}

#[test]
fn servers_accepts_a_list_of_hostlists() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = ["a[1-2]", "b"]
context = "dftfsub_all"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.entries[0].servers, vec!["a1", "a2", "b"]);
}

#[test]
fn bad_hostlist_is_a_config_error() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "foo[2-1]"
context = "dftfsub_all"
"#;
    assert!(load_config_from_str(toml).is_err());
}

#[test]
fn invalid_sample_mode_fails() {
    let toml = r#"
[general]
sample_mode = "sometimes"
"#;
    assert!(load_config_from_str(toml).is_err());
}

#[test]
fn zero_worker_count_fails() {
    assert!(load_config_from_str("[general]\nworker_count = 0\n").is_err());
}

#[test]
fn resubscribe_interval_overrides_refresh() {
    let toml = r#"
[general]
refresh_interval = 600
resubscribe_interval = 60
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.general.effective_refresh_interval(), 60);
}

#[test]
fn opaque_bus_tables_pass_through_as_strings() {
    let toml = r#"
[kafka]
"bootstrap.servers" = "kafka:9092"
"queue.buffering.max.ms" = 50

[schema_registry]
url = "http://registry:8081"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.kafka["bootstrap.servers"], "kafka:9092");
    assert_eq!(cfg.kafka["queue.buffering.max.ms"], "50");
    assert_eq!(cfg.schema_registry["url"], "http://registry:8081");
}

// ---------------------------------------------------------------------------
// Endpoint ownership
// ---------------------------------------------------------------------------

#[test]
fn endpoints_union_across_entries_without_owners() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "a[1-2]"
context = "dftfsub_x"

[[subscription]]
servers = "a2,b1"
context = "dftfsub_y"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.endpoints("anyhost"), vec!["a1", "a2", "b1"]);
}

#[test]
fn owners_table_restricts_endpoints_per_instance() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "a[1-4]"
context = "dftfsub_all"

[owners]
relay01 = "a[1-2]"
relay02 = "a[3-4]"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.endpoints("relay01"), vec!["a1", "a2"]);
    assert_eq!(cfg.endpoints("relay02"), vec!["a3", "a4"]);
    assert!(cfg.endpoints("relay03").is_empty());
}

// ---------------------------------------------------------------------------
// Desired-state derivation
// ---------------------------------------------------------------------------

#[test]
fn desired_destination_defaults_to_this_relay() {
    let cfg = load_config_from_str(MINIMAL).expect("should load");
    let desired = cfg.build_desired("10.0.0.1").expect("derive");
    let subs = &desired["foo-cmm1"];
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].destination, "10.0.0.1:9127/redfish");
    assert_eq!(subs[0].context, "dftfsub_all");
    assert_eq!(subs[0].protocol, "Redfish");
}

#[test]
fn explicit_destinations_and_port_override() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "foo"
context = "dftfsub_ha"
destinations = ["relay-a", "relay-b"]
destinations_port = 9200
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    let desired = cfg.build_desired("ignored").expect("derive");
    let subs = &desired["foo"];
    assert_eq!(subs.len(), 2);
    assert_eq!(subs[0].destination, "relay-a:9200/redfish");
    assert_eq!(subs[1].destination, "relay-b:9200/redfish");
}

#[test]
fn duplicate_destination_and_context_is_rejected() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "foo"
context = "dftfsub_all"

[[subscription]]
servers = "foo"
context = "dftfsub_all"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert!(cfg.build_desired("10.0.0.1").is_err());
}

#[test]
fn registry_prefixes_carry_into_desired_subs() {
    let toml = r#"
[general]
redfish_username = "root"
redfish_password = "secret"

[[subscription]]
servers = "foo"
context = "dftfsub_telemetry"
registry_prefixes = ["CrayTelemetry"]
exclude_message_ids = ["CrayTelemetry.Power"]
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    let desired = cfg.build_desired("10.0.0.1").expect("derive");
    let sub = &desired["foo"][0];
    assert_eq!(sub.registry_prefixes, vec!["CrayTelemetry"]);
    assert_eq!(sub.exclude_message_ids, vec!["CrayTelemetry.Power"]);
}
