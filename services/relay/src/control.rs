//! Signal handling.
//!
//! Signals are converted to values on a bounded control channel and the
//! main loop selects over it; handlers never mutate state themselves.
//! The channel holds one message, so a signal arriving while another is
//! still pending is dropped (edge-triggered).

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMsg {
    /// HUP / USR1: reload config, then reconcile out of cycle.
    Reconcile,
    /// USR2: purge every owned subscription, then exit.
    Purge,
    /// TERM / INT: graceful shutdown.
    Shutdown,
}

/// Spawn the signal listener feeding `tx`.
pub fn spawn_signal_listener(tx: mpsc::Sender<ControlMsg>) {
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGUSR1 handler");
                return;
            }
        };
        let mut usr2 = match signal(SignalKind::user_defined2()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGUSR2 handler");
                return;
            }
        };
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };

        loop {
            let msg = tokio::select! {
                _ = hup.recv() => ControlMsg::Reconcile,
                _ = usr1.recv() => ControlMsg::Reconcile,
                _ = usr2.recv() => ControlMsg::Purge,
                _ = term.recv() => ControlMsg::Shutdown,
                _ = tokio::signal::ctrl_c() => ControlMsg::Shutdown,
            };
            info!(?msg, "signal received");

            match tx.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // A control message is already pending; coalesce.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    });
}
