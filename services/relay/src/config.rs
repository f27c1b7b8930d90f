//! Relay configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides
//! (the log filter alone honors `RUST_LOG`).
//! Default config path: `/etc/redfish-relay/relay.toml`.
//!
//! # Required fields
//! - `general.redfish_username` / `general.redfish_password` when any
//!   `[[subscription]]` entry is present
//! - `subscription.servers` and `subscription.context` per entry
//!
//! Every subscription context must begin with `general.context_prefix`;
//! the prefix is what scopes deletions during reconciliation, so an
//! unprefixed context would create subscriptions the reconciler later
//! refuses to own.

use crate::hostlist::expand_hostlist;
use relay_protocol::DesiredSubscription;
use std::collections::{HashMap, HashSet};
use std::net::ToSocketAddrs;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub general: GeneralConfig,
    pub entries: Vec<SubscriptionEntry>,
    /// Optional instance-ownership table: daemon hostname -> hostlist of
    /// endpoints that instance reconciles.  Absent means own everything.
    pub owners: Option<HashMap<String, Vec<String>>>,
    /// Passed through to the bus client opaquely.
    pub kafka: HashMap<String, String>,
    /// Passed through to the schema-registry client opaquely.
    pub schema_registry: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Reconciler cadence in seconds.
    pub refresh_interval: u64,
    /// When > 0, overrides `refresh_interval`.
    pub resubscribe_interval: u64,
    pub context_prefix: String,
    pub purge_unrecognized: bool,
    /// Reconciler parallelism bound.
    pub max_workers: usize,
    pub redfish_username: String,
    pub redfish_password: String,
    pub topic_prefix: String,
    /// Seconds between accepted telemetry events per source; 0 disables.
    pub sample_period: u64,
    pub sample_mode: SampleMode,
    /// Number of ingest worker lanes.
    pub worker_count: usize,
    pub address: String,
    pub port: u16,
    /// Endpoint client request timeout, seconds.
    pub subscription_timeout: u64,
    pub subscription_retries: u32,
    pub log_alerts: bool,
    pub log_alerts_file: String,
    /// Log would-be emissions instead of producing to the bus.
    pub no_kafka: bool,
}

impl GeneralConfig {
    /// Effective reconcile cadence: `resubscribe_interval` wins when set.
    pub fn effective_refresh_interval(&self) -> u64 {
        if self.resubscribe_interval > 0 {
            self.resubscribe_interval
        } else {
            self.refresh_interval
        }
    }
}

/// Per-source sampling key granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Key by `(client_ip, MessageId)`: one budget per metric family.
    PerMessageId,
    /// Key by `client_ip` alone: one budget per pusher.
    PerClient,
}

impl SampleMode {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "per-message-id" => Ok(SampleMode::PerMessageId),
            "per-client" => Ok(SampleMode::PerClient),
            other => Err(ConfigError::InvalidValue(format!(
                "sample_mode must be 'per-message-id' or 'per-client', got '{}'",
                other
            ))),
        }
    }
}

/// One `[[subscription]]` entry after hostlist expansion.
#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    /// Expanded endpoint hostnames.
    pub servers: Vec<String>,
    pub context: String,
    pub registry_prefixes: Vec<String>,
    pub exclude_registry_prefixes: Vec<String>,
    pub message_ids: Vec<String>,
    pub exclude_message_ids: Vec<String>,
    /// Explicit destination hosts; empty means "this relay".
    pub destinations: Vec<String>,
    /// Port override for destinations; None means `general.port`.
    pub destinations_port: Option<u16>,
    /// Resolve destination hostnames to IPv4 before subscribing.
    pub destinations_use_ip: bool,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct RawConfig {
    general: Option<RawGeneral>,
    #[serde(rename = "subscription")]
    subscriptions: Option<Vec<RawSubscription>>,
    owners: Option<HashMap<String, String>>,
    kafka: Option<toml::value::Table>,
    schema_registry: Option<toml::value::Table>,
}

#[derive(Debug, serde::Deserialize)]
struct RawGeneral {
    log_level: Option<String>,
    refresh_interval: Option<u64>,
    resubscribe_interval: Option<u64>,
    context_prefix: Option<String>,
    purge_unrecognized: Option<bool>,
    max_workers: Option<usize>,
    redfish_username: Option<String>,
    redfish_password: Option<String>,
    topic_prefix: Option<String>,
    sample_period: Option<u64>,
    sample_mode: Option<String>,
    worker_count: Option<usize>,
    address: Option<String>,
    port: Option<u16>,
    subscription_timeout: Option<u64>,
    subscription_retries: Option<u32>,
    log_alerts: Option<bool>,
    log_alerts_file: Option<String>,
    no_kafka: Option<bool>,
}

#[derive(Debug, serde::Deserialize)]
struct RawSubscription {
    servers: Option<toml::Value>,
    context: Option<String>,
    registry_prefixes: Option<Vec<String>>,
    exclude_registry_prefixes: Option<Vec<String>>,
    message_ids: Option<Vec<String>>,
    exclude_message_ids: Option<Vec<String>>,
    destinations: Option<Vec<String>>,
    destinations_port: Option<u16>,
    destinations_use_ip: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load relay config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load relay config from the default path `/etc/redfish-relay/relay.toml`.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/redfish-relay/relay.toml"))
}

/// Load relay config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let general = build_general(raw.general)?;

    let mut entries = Vec::new();
    for (i, raw_entry) in raw.subscriptions.unwrap_or_default().into_iter().enumerate() {
        entries.push(build_entry(i, raw_entry, &general.context_prefix)?);
    }

    if !entries.is_empty()
        && (general.redfish_username.is_empty() || general.redfish_password.is_empty())
    {
        return Err(ConfigError::MissingField(
            "general.redfish_username / general.redfish_password".to_owned(),
        ));
    }

    let owners = match raw.owners {
        None => None,
        Some(table) => {
            let mut map = HashMap::new();
            for (instance, list) in table {
                let hosts = expand_hostlist(&list).map_err(|e| {
                    ConfigError::InvalidValue(format!("owners.{}: {}", instance, e))
                })?;
                map.insert(instance, hosts);
            }
            Some(map)
        }
    };

    Ok(RelayConfig {
        general,
        entries,
        owners,
        kafka: flatten_table(raw.kafka),
        schema_registry: flatten_table(raw.schema_registry),
    })
}

impl RelayConfig {
    /// The endpoints this instance reconciles: the union of all entry
    /// servers, restricted by the `[owners]` table when one is present.
    pub fn endpoints(&self, instance: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();
        for entry in &self.entries {
            for server in &entry.servers {
                if seen.insert(server.clone()) {
                    hosts.push(server.clone());
                }
            }
        }
        match &self.owners {
            None => hosts,
            Some(owners) => {
                let owned: HashSet<&String> =
                    owners.get(instance).into_iter().flatten().collect();
                hosts.into_iter().filter(|h| owned.contains(h)).collect()
            }
        }
    }

    /// Build the desired subscription set per endpoint.
    ///
    /// `default_host` is this relay's own reachable name or address; it
    /// becomes the destination for entries without explicit destinations.
    /// Returns `ConfigError` when two desired subscriptions on the same
    /// endpoint would share both destination and context.
    pub fn build_desired(
        &self,
        default_host: &str,
    ) -> Result<HashMap<String, Vec<DesiredSubscription>>, ConfigError> {
        let mut desired: HashMap<String, Vec<DesiredSubscription>> = HashMap::new();

        for entry in &self.entries {
            let port = entry.destinations_port.unwrap_or(self.general.port);
            let dest_hosts: Vec<String> = if entry.destinations.is_empty() {
                vec![default_host.to_owned()]
            } else {
                entry.destinations.clone()
            };

            for server in &entry.servers {
                for dest_host in &dest_hosts {
                    let host = if entry.destinations_use_ip {
                        resolve_ipv4(dest_host).unwrap_or_else(|| dest_host.clone())
                    } else {
                        dest_host.clone()
                    };
                    desired
                        .entry(server.clone())
                        .or_default()
                        .push(DesiredSubscription {
                            destination: format!("{}:{}/redfish", host, port),
                            context: entry.context.clone(),
                            registry_prefixes: entry.registry_prefixes.clone(),
                            exclude_registry_prefixes: entry.exclude_registry_prefixes.clone(),
                            message_ids: entry.message_ids.clone(),
                            exclude_message_ids: entry.exclude_message_ids.clone(),
                            protocol: "Redfish".to_owned(),
                        });
                }
            }
        }

        for (endpoint, subs) in &desired {
            let mut seen = HashSet::new();
            for sub in subs {
                if !seen.insert((sub.destination.clone(), sub.context.clone())) {
                    return Err(ConfigError::InvalidValue(format!(
                        "duplicate subscription (destination '{}', context '{}') on endpoint '{}'",
                        sub.destination, sub.context, endpoint
                    )));
                }
            }
        }

        Ok(desired)
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

fn build_general(raw: Option<RawGeneral>) -> Result<GeneralConfig, ConfigError> {
    let raw = raw.unwrap_or(RawGeneral {
        log_level: None,
        refresh_interval: None,
        resubscribe_interval: None,
        context_prefix: None,
        purge_unrecognized: None,
        max_workers: None,
        redfish_username: None,
        redfish_password: None,
        topic_prefix: None,
        sample_period: None,
        sample_mode: None,
        worker_count: None,
        address: None,
        port: None,
        subscription_timeout: None,
        subscription_retries: None,
        log_alerts: None,
        log_alerts_file: None,
        no_kafka: None,
    });

    let worker_count = raw.worker_count.unwrap_or(4);
    if worker_count == 0 {
        return Err(ConfigError::InvalidValue(
            "worker_count must be at least 1".to_owned(),
        ));
    }
    let max_workers = raw.max_workers.unwrap_or(32);
    if max_workers == 0 {
        return Err(ConfigError::InvalidValue(
            "max_workers must be at least 1".to_owned(),
        ));
    }
    let port = raw.port.unwrap_or(9127);
    if port == 0 {
        return Err(ConfigError::InvalidValue("port must be non-zero".to_owned()));
    }

    let sample_mode = match raw.sample_mode {
        Some(s) => SampleMode::parse(&s)?,
        None => SampleMode::PerMessageId,
    };

    Ok(GeneralConfig {
        log_level: raw.log_level.unwrap_or_else(|| "info".to_owned()),
        refresh_interval: raw.refresh_interval.unwrap_or(600),
        resubscribe_interval: raw.resubscribe_interval.unwrap_or(0),
        context_prefix: raw.context_prefix.unwrap_or_else(|| "dftfsub_".to_owned()),
        purge_unrecognized: raw.purge_unrecognized.unwrap_or(false),
        max_workers,
        redfish_username: raw.redfish_username.unwrap_or_default(),
        redfish_password: raw.redfish_password.unwrap_or_default(),
        topic_prefix: raw.topic_prefix.unwrap_or_else(|| "redfish-".to_owned()),
        sample_period: raw.sample_period.unwrap_or(10),
        sample_mode,
        worker_count,
        address: raw.address.unwrap_or_else(|| "0.0.0.0".to_owned()),
        port,
        subscription_timeout: raw.subscription_timeout.unwrap_or(15),
        subscription_retries: raw.subscription_retries.unwrap_or(2),
        log_alerts: raw.log_alerts.unwrap_or(false),
        log_alerts_file: raw
            .log_alerts_file
            .unwrap_or_else(|| "/var/log/redfish-relay/alerts.log".to_owned()),
        no_kafka: raw.no_kafka.unwrap_or(false),
    })
}

fn build_entry(
    index: usize,
    raw: RawSubscription,
    context_prefix: &str,
) -> Result<SubscriptionEntry, ConfigError> {
    let servers_value = raw
        .servers
        .ok_or_else(|| ConfigError::MissingField(format!("subscription[{}].servers", index)))?;

    // `servers` accepts a hostlist string or a list of hostlist strings.
    let server_lists: Vec<String> = match servers_value {
        toml::Value::String(s) => vec![s],
        toml::Value::Array(items) => {
            let mut lists = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    toml::Value::String(s) => lists.push(s),
                    other => {
                        return Err(ConfigError::InvalidValue(format!(
                            "subscription[{}].servers entries must be strings, got {}",
                            index, other
                        )));
                    }
                }
            }
            lists
        }
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "subscription[{}].servers must be a string or list of strings, got {}",
                index, other
            )));
        }
    };

    let mut servers = Vec::new();
    for list in &server_lists {
        let hosts = expand_hostlist(list).map_err(|e| {
            ConfigError::InvalidValue(format!("subscription[{}].servers: {}", index, e))
        })?;
        servers.extend(hosts);
    }

    let context = raw
        .context
        .ok_or_else(|| ConfigError::MissingField(format!("subscription[{}].context", index)))?;
    if !context.starts_with(context_prefix) {
        return Err(ConfigError::InvalidValue(format!(
            "subscription[{}].context '{}' must begin with context_prefix '{}'",
            index, context, context_prefix
        )));
    }

    Ok(SubscriptionEntry {
        servers,
        context,
        registry_prefixes: raw.registry_prefixes.unwrap_or_default(),
        exclude_registry_prefixes: raw.exclude_registry_prefixes.unwrap_or_default(),
        message_ids: raw.message_ids.unwrap_or_default(),
        exclude_message_ids: raw.exclude_message_ids.unwrap_or_default(),
        destinations: raw.destinations.unwrap_or_default(),
        destinations_port: raw.destinations_port,
        destinations_use_ip: raw.destinations_use_ip.unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Flatten an opaque TOML table to string key/values for client configs.
fn flatten_table(table: Option<toml::value::Table>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in table.unwrap_or_default() {
        let s = match value {
            toml::Value::String(s) => s,
            other => other.to_string(),
        };
        map.insert(key, s);
    }
    map
}

/// Best-effort forward resolution of a hostname to a dotted IPv4 string.
fn resolve_ipv4(host: &str) -> Option<String> {
    // Port is irrelevant; ToSocketAddrs requires one.
    (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .find(|a| a.is_ipv4())
        .map(|a| a.ip().to_string())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
