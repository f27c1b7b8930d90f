//! redfish-relay: telemetry and event relay for a BMC fleet.
//!
//! Two halves share this process: the subscription reconciler keeps
//! every managed endpoint pushing its events here, and the ingest
//! pipeline turns those pushes into schema-validated bus records.

pub mod alerts;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod hostlist;
pub mod lane;
pub mod listener;
pub mod producer;
pub mod reconciler;
pub mod resolver;
pub mod schema;

use crate::alerts::AlertsLog;
use crate::config::{load_config_from_path, RelayConfig};
use crate::control::{spawn_signal_listener, ControlMsg};
use crate::lane::{Job, Lane, PayloadProcessor};
use crate::listener::{LaneSenders, Listener};
use crate::producer::{build_sink, SinkError, Topics};
use crate::reconciler::ReconcileCommand;
use crate::resolver::{cluster_name, local_hostname, HostResolver};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Per-lane input queue depth.
const LANE_QUEUE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
    #[error("bus sink: {0}")]
    Sink(#[from] SinkError),
}

/// Run the relay until a shutdown or purge signal.
pub async fn run(config_path: PathBuf, initial: RelayConfig) -> Result<(), RunError> {
    let instance = local_hostname();
    let cluster = cluster_name(&instance);
    let topics = Topics::from_prefix(&initial.general.topic_prefix);
    let bind = format!("{}:{}", initial.general.address, initial.general.port);
    let worker_count = initial.general.worker_count;

    let resolver = Arc::new(HostResolver::new());

    // Worker lanes.  A sink failure at startup is fatal; a lane must not
    // start without its producer.
    let mut senders = Vec::with_capacity(worker_count);
    let mut lane_handles = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
        let (tx, handle) = start_lane(index, &initial, &topics, &cluster, resolver.clone()).await?;
        senders.push(tx);
        lane_handles.push(handle);
    }
    let lanes: LaneSenders = Arc::new(Mutex::new(senders));

    let shared = Arc::new(RwLock::new(initial));

    // Ingest listener.
    let (supervisor_tx, mut supervisor_rx) = mpsc::channel::<usize>(worker_count.max(1));
    let (stop_tx, stop_rx) = watch::channel(false);
    let _listener = Listener::start(&bind, lanes.clone(), supervisor_tx, stop_rx).await?;

    // Reconciler.
    let (reconcile_tx, reconcile_rx) = mpsc::channel::<ReconcileCommand>(4);
    let reconciler_handle = tokio::spawn(reconciler::run(
        shared.clone(),
        instance.clone(),
        reconcile_rx,
    ));

    // Signals.
    let (control_tx, mut control_rx) = mpsc::channel::<ControlMsg>(1);
    spawn_signal_listener(control_tx);

    info!(instance = %instance, cluster = %cluster, lanes = worker_count, "relay running");

    // Main supervision loop.
    let mut supervisor_open = true;
    loop {
        tokio::select! {
            dead = supervisor_rx.recv(), if supervisor_open => {
                let Some(index) = dead else {
                    supervisor_open = false;
                    continue;
                };
                warn!(lane = index, "restarting dead lane");
                let snapshot = match shared.read() {
                    Ok(guard) => guard.clone(),
                    Err(_) => break,
                };
                match start_lane(index, &snapshot, &topics, &cluster, resolver.clone()).await {
                    Ok((tx, handle)) => {
                        if let Ok(mut guard) = lanes.lock() {
                            guard[index] = tx;
                        }
                        lane_handles[index] = handle;
                        info!(lane = index, "lane restarted");
                    }
                    Err(e) => {
                        // Clients stay mapped to this index; their payloads
                        // drop until a later restart succeeds.
                        error!(lane = index, error = %e, "lane restart failed");
                    }
                }
            }
            msg = control_rx.recv() => {
                match msg {
                    None | Some(ControlMsg::Shutdown) => {
                        let _ = reconcile_tx.send(ReconcileCommand::Shutdown).await;
                        break;
                    }
                    Some(ControlMsg::Purge) => {
                        info!("purge requested, removing owned subscriptions before exit");
                        let _ = reconcile_tx.send(ReconcileCommand::Purge).await;
                        break;
                    }
                    Some(ControlMsg::Reconcile) => {
                        match load_config_from_path(&config_path) {
                            Ok(new_config) => {
                                if let Ok(mut guard) = shared.write() {
                                    *guard = new_config;
                                }
                                info!("config reloaded");
                            }
                            Err(e) => {
                                warn!(error = %e, "config reload failed, keeping previous config");
                            }
                        }
                        let _ = reconcile_tx.send(ReconcileCommand::Cycle).await;
                    }
                }
            }
        }
    }

    // Orderly shutdown: sentinel every lane and join them (each lane
    // drains its sink on the way out), stop the listener, then join the
    // reconciler (a purge cycle may still be finishing).
    let senders: Vec<mpsc::Sender<Job>> = match lanes.lock() {
        Ok(guard) => guard.clone(),
        Err(_) => Vec::new(),
    };
    for sender in senders {
        let _ = sender.send(Job::Shutdown).await;
    }
    for handle in lane_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "lane task failed");
        }
    }

    let _ = stop_tx.send(true);

    if let Err(e) = reconciler_handle.await {
        warn!(error = %e, "reconciler task failed");
    }

    info!("relay stopped");
    Ok(())
}

/// Build one lane: bounded input channel, its own bus sink, lane-local
/// sampling state.
async fn start_lane(
    index: usize,
    config: &RelayConfig,
    topics: &Topics,
    cluster: &str,
    resolver: Arc<HostResolver>,
) -> Result<(mpsc::Sender<Job>, JoinHandle<()>), SinkError> {
    let (tx, rx) = mpsc::channel(LANE_QUEUE);
    let sink = build_sink(config, topics).await?;
    let general = &config.general;

    let lane = Lane::new(
        index,
        rx,
        sink,
        resolver,
        AlertsLog::new(general.log_alerts, &general.log_alerts_file),
        topics.clone(),
        PayloadProcessor::new(
            cluster.to_owned(),
            Duration::from_secs(general.sample_period),
            general.sample_mode,
        ),
    );
    Ok((tx, tokio::spawn(lane.run())))
}
