//! Cached host name resolution.
//!
//! Pushed events identify their source only by client IP; the resolver
//! turns that into the site-preferred name for record Location fields.
//! Site convention: component names begin with `x` (e.g. `x1000c0s0b0`),
//! and a BMC often carries both a component name and an infrastructure
//! name, so the `x` name wins when the PTR answer has several.
//!
//! Lookups never fail loudly; any error returns the input unchanged.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

pub struct HostResolver {
    resolver: Option<TokioAsyncResolver>,
    // First writer wins; duplicate lookups for a racing key are acceptable.
    cache: RwLock<HashMap<String, String>>,
}

impl HostResolver {
    /// Build a resolver from the system configuration.
    ///
    /// A host without usable resolver config degrades to identity
    /// resolution rather than failing startup.
    pub fn new() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => Some(r),
            Err(e) => {
                debug!(error = %e, "no system resolver config, name resolution disabled");
                None
            }
        };
        HostResolver {
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a hostname or IP to its preferred canonical name.
    pub async fn resolve(&self, host: &str) -> String {
        if let Some(hit) = self.cache.read().ok().and_then(|c| c.get(host).cloned()) {
            return hit;
        }

        let resolved = self.lookup(host).await.unwrap_or_else(|| host.to_owned());

        if let Ok(mut cache) = self.cache.write() {
            cache.entry(host.to_owned()).or_insert(resolved.clone());
        }
        resolved
    }

    async fn lookup(&self, host: &str) -> Option<String> {
        let resolver = self.resolver.as_ref()?;

        let ip: IpAddr = match host.parse() {
            Ok(ip) => ip,
            // Forward-resolve a name first, then take the preferred PTR name.
            Err(_) => resolver.lookup_ip(host).await.ok()?.iter().next()?,
        };

        let ptr = resolver.reverse_lookup(ip).await.ok()?;
        let names: Vec<String> = ptr
            .iter()
            .map(|name| name.to_utf8().trim_end_matches('.').to_owned())
            .collect();
        pick_name(&names)
    }
}

/// Prefer the first name beginning with `x`, else the first name.
fn pick_name(names: &[String]) -> Option<String> {
    names
        .iter()
        .find(|n| n.starts_with('x'))
        .or_else(|| names.first())
        .cloned()
}

// ---------------------------------------------------------------------------
// Process identity helpers
// ---------------------------------------------------------------------------

/// This machine's hostname, or "localhost" when unavailable.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Cluster name: the local hostname with trailing digits stripped.
pub fn cluster_name(host: &str) -> String {
    host.trim_end_matches(|c: char| c.is_ascii_digit()).to_owned()
}
