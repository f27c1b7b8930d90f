//! Declarative subscription reconciliation.
//!
//! Each cycle converges every managed endpoint's live subscription set
//! with the desired set derived from config:
//!
//! 1. Pair each desired subscription with a live one by context
//! 2. Exact field match -> keep; drift -> remove + re-add
//! 3. Unmatched live entries inside the context namespace are removed;
//!    foreign entries are kept unless `purge_unrecognized` is set
//! 4. Removes execute before adds
//!
//! Endpoint failures are isolated: one endpoint's error never aborts the
//! cycle, and a single failed operation never aborts its endpoint.

use crate::config::RelayConfig;
use crate::endpoint::{EndpointError, EndpointSession};
use futures_util::{stream, StreamExt};
use relay_protocol::{DesiredSubscription, LiveSubscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

/// The operations one endpoint needs to converge.
#[derive(Debug, Default)]
pub struct Plan {
    pub keeps: Vec<LiveSubscription>,
    pub removes: Vec<LiveSubscription>,
    pub adds: Vec<DesiredSubscription>,
}

impl Plan {
    pub fn is_noop(&self) -> bool {
        self.removes.is_empty() && self.adds.is_empty()
    }
}

/// Context is the identity key; everything else detects drift.
fn full_match(desired: &DesiredSubscription, live: &LiveSubscription) -> bool {
    desired.context == live.context
        && desired.destination == live.destination
        && sorted(&desired.registry_prefixes) == sorted(&live.registry_prefixes)
        && sorted(&desired.exclude_registry_prefixes) == sorted(&live.exclude_registry_prefixes)
        && sorted(&desired.message_ids) == sorted(&live.message_ids)
        && sorted(&desired.exclude_message_ids) == sorted(&live.exclude_message_ids)
        // Older firmware omits Protocol when listing; don't churn on it.
        && (live.protocol.is_empty() || desired.protocol == live.protocol)
}

fn sorted(list: &[String]) -> Vec<String> {
    let mut copy = list.to_vec();
    copy.sort();
    copy
}

/// Compute the convergence plan for one endpoint.
///
/// When several live entries share a context (multi-destination configs),
/// a desired subscription prefers the live entry it matches exactly, so a
/// converged endpoint stays a no-op on the next cycle.
pub fn diff(
    desired: &[DesiredSubscription],
    live: &[LiveSubscription],
    context_prefix: &str,
    purge_unrecognized: bool,
) -> Plan {
    let mut remaining: Vec<LiveSubscription> = live.to_vec();
    let mut plan = Plan::default();

    for d in desired {
        let position = remaining
            .iter()
            .position(|l| l.context == d.context && full_match(d, l))
            .or_else(|| remaining.iter().position(|l| l.context == d.context));
        match position {
            None => plan.adds.push(d.clone()),
            Some(i) => {
                let l = remaining.remove(i);
                if full_match(d, &l) {
                    plan.keeps.push(l);
                } else {
                    plan.removes.push(l);
                    plan.adds.push(d.clone());
                }
            }
        }
    }

    for l in remaining {
        if l.context.starts_with(context_prefix) || purge_unrecognized {
            plan.removes.push(l);
        } else {
            plan.keeps.push(l);
        }
    }

    plan
}

// ---------------------------------------------------------------------------
// Per-endpoint convergence
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConvergeStats {
    pub kept: usize,
    pub removed: usize,
    pub added: usize,
    pub failed: usize,
}

/// Execute a plan against one endpoint: removes first, then adds.
///
/// A failed operation is logged and skipped; it does not abort the endpoint.
pub async fn converge_endpoint(session: &EndpointSession, plan: &Plan) -> ConvergeStats {
    let mut stats = ConvergeStats {
        kept: plan.keeps.len(),
        ..ConvergeStats::default()
    };

    for live in &plan.removes {
        match session.delete_subscription(&live.handle).await {
            Ok(()) => stats.removed += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(endpoint = %session.host(), context = %live.context, error = %e,
                    "failed to delete subscription");
            }
        }
    }

    for desired in &plan.adds {
        match session.create_subscription(desired).await {
            Ok(_) => stats.added += 1,
            Err(e) => {
                stats.failed += 1;
                warn!(endpoint = %session.host(), context = %desired.context, error = %e,
                    "failed to create subscription");
            }
        }
    }

    stats
}

/// One full reconcile attempt against one endpoint: open, list, diff,
/// converge.  The session is owned by this attempt and dropped on every
/// exit path.
async fn reconcile_endpoint(
    config: &RelayConfig,
    host: &str,
    desired: &[DesiredSubscription],
) -> Result<ConvergeStats, EndpointError> {
    let general = &config.general;
    let session = EndpointSession::open(
        host,
        &general.redfish_username,
        &general.redfish_password,
        Duration::from_secs(general.subscription_timeout),
        general.subscription_retries,
    )
    .await?;

    let live = session.list_subscriptions().await?;
    let plan = diff(
        desired,
        &live,
        &general.context_prefix,
        general.purge_unrecognized,
    );
    if plan.is_noop() {
        debug!(endpoint = %host, kept = plan.keeps.len(), "endpoint already converged");
        return Ok(ConvergeStats {
            kept: plan.keeps.len(),
            ..ConvergeStats::default()
        });
    }

    Ok(converge_endpoint(&session, &plan).await)
}

// ---------------------------------------------------------------------------
// Fleet driver
// ---------------------------------------------------------------------------

/// Reconcile every endpoint with bounded parallelism.
///
/// `purge` treats the desired set as empty everywhere (namespace-scoped
/// removal still applies).  Setting `cancel` stops the cycle between
/// endpoints: work already in flight runs to completion, endpoints not
/// yet started are skipped.
pub async fn run_cycle(
    config: &RelayConfig,
    instance: &str,
    purge: bool,
    cancel: &AtomicBool,
) -> ConvergeStats {
    let endpoints = config.endpoints(instance);
    if endpoints.is_empty() {
        debug!("no endpoints to reconcile");
        return ConvergeStats::default();
    }

    let desired: HashMap<String, Vec<DesiredSubscription>> = if purge {
        HashMap::new()
    } else {
        match config.build_desired(instance) {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "cannot build desired subscription state, skipping cycle");
                return ConvergeStats::default();
            }
        }
    };

    let parallelism = config.general.max_workers.min(endpoints.len());
    let empty: Vec<DesiredSubscription> = Vec::new();

    let results: Vec<ConvergeStats> = stream::iter(endpoints.iter().cloned())
        .map(|host| {
            let wanted = desired.get(&host).unwrap_or(&empty);
            async move {
                if cancel.load(Ordering::Relaxed) {
                    debug!(endpoint = %host, "cycle cancelled, endpoint skipped");
                    return ConvergeStats::default();
                }
                match reconcile_endpoint(config, &host, wanted).await {
                    Ok(stats) => stats,
                    Err(e) => {
                        // Unreachable endpoints are routine in a large fleet.
                        debug!(endpoint = %host, error = %e, "endpoint skipped this cycle");
                        ConvergeStats::default()
                    }
                }
            }
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;

    let mut total = ConvergeStats::default();
    for s in &results {
        total.kept += s.kept;
        total.removed += s.removed;
        total.added += s.added;
        total.failed += s.failed;
    }
    info!(
        endpoints = endpoints.len(),
        kept = total.kept,
        removed = total.removed,
        added = total.added,
        failed = total.failed,
        purge,
        cancelled = cancel.load(Ordering::Relaxed),
        "reconcile cycle complete"
    );
    total
}

// ---------------------------------------------------------------------------
// Refresh loop
// ---------------------------------------------------------------------------

/// Commands accepted by the reconcile loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileCommand {
    /// Run an out-of-cycle reconcile now (config was already reloaded).
    Cycle,
    /// Run one purge cycle, then return.
    Purge,
    Shutdown,
}

/// Run reconcile cycles until shutdown.
///
/// A cycle runs at start and every effective refresh interval after; an
/// overrun cycle logs a warning and the next starts immediately.  A
/// control command arriving mid-cycle cancels the cycle between
/// endpoints: the endpoint currently mid-flight finishes its network
/// calls before the command is acted on.
pub async fn run(
    config: Arc<RwLock<RelayConfig>>,
    instance: String,
    mut control: mpsc::Receiver<ReconcileCommand>,
) {
    loop {
        let snapshot = match config.read() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        let interval = Duration::from_secs(snapshot.general.effective_refresh_interval());
        let started = Instant::now();

        let cancel = AtomicBool::new(false);
        let cycle = run_cycle(&snapshot, &instance, false, &cancel);
        tokio::pin!(cycle);

        let mut interrupted = None;
        tokio::select! {
            _ = &mut cycle => {}
            command = control.recv() => {
                // Stop starting new endpoints; the cycle is drained
                // below so in-flight work finishes first.
                cancel.store(true, Ordering::Relaxed);
                interrupted = Some(command);
            }
        }
        if let Some(command) = interrupted {
            cycle.await;
            match command {
                None | Some(ReconcileCommand::Shutdown) => return,
                // Re-enter with freshly reloaded config.
                Some(ReconcileCommand::Cycle) => continue,
                Some(ReconcileCommand::Purge) => {
                    run_purge(&config, &instance).await;
                    return;
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > interval {
            warn!(
                elapsed_secs = elapsed.as_secs(),
                interval_secs = interval.as_secs(),
                "reconcile cycle overran the refresh interval, starting next immediately"
            );
            continue;
        }

        tokio::select! {
            command = control.recv() => match command {
                None | Some(ReconcileCommand::Shutdown) => return,
                Some(ReconcileCommand::Cycle) => continue,
                Some(ReconcileCommand::Purge) => {
                    run_purge(&config, &instance).await;
                    return;
                }
            },
            () = tokio::time::sleep(interval - elapsed) => {}
        }
    }
}

async fn run_purge(config: &Arc<RwLock<RelayConfig>>, instance: &str) {
    let snapshot = match config.read() {
        Ok(guard) => guard.clone(),
        Err(_) => return,
    };
    run_cycle(&snapshot, instance, true, &AtomicBool::new(false)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(context: &str, destination: &str) -> LiveSubscription {
        LiveSubscription {
            handle: format!("/redfish/v1/EventService/Subscriptions/{}", context),
            destination: destination.to_owned(),
            context: context.to_owned(),
            registry_prefixes: Vec::new(),
            exclude_registry_prefixes: Vec::new(),
            message_ids: Vec::new(),
            exclude_message_ids: Vec::new(),
            protocol: "Redfish".to_owned(),
        }
    }

    #[test]
    fn list_fields_compare_sorted_and_missing_as_empty() {
        let mut d = DesiredSubscription::new("10.0.0.1:9127/redfish", "dftfsub_all");
        d.registry_prefixes = vec!["B".to_owned(), "A".to_owned()];
        let mut l = live("dftfsub_all", "10.0.0.1:9127/redfish");
        l.registry_prefixes = vec!["A".to_owned(), "B".to_owned()];
        assert!(full_match(&d, &l));

        l.registry_prefixes.clear();
        assert!(!full_match(&d, &l));
    }

    #[test]
    fn empty_live_protocol_does_not_count_as_drift() {
        let d = DesiredSubscription::new("10.0.0.1:9127/redfish", "dftfsub_all");
        let mut l = live("dftfsub_all", "10.0.0.1:9127/redfish");
        l.protocol = String::new();
        assert!(full_match(&d, &l));
    }

    #[test]
    fn same_context_prefers_exact_live_match() {
        let d1 = DesiredSubscription::new("a:9127/redfish", "dftfsub_ha");
        let d2 = DesiredSubscription::new("b:9127/redfish", "dftfsub_ha");
        let l1 = live("dftfsub_ha", "b:9127/redfish");
        let l2 = live("dftfsub_ha", "a:9127/redfish");
        let plan = diff(&[d1, d2], &[l1, l2], "dftfsub_", false);
        assert!(plan.is_noop(), "exact pairing should avoid churn: {:?}", plan);
    }
}
