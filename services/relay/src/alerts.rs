//! Alerts file mirror for generic events.
//!
//! One space-separated line per event:
//! `<ts> <Location> <MessageId> <Severity> "<Message>" <OriginOfCondition>`
//!
//! Write failures must not disturb the pipeline; the first failure logs
//! a warning and later ones stay silent.

use relay_protocol::EventRecord;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

pub struct AlertsLog {
    path: Option<PathBuf>,
    warned: bool,
}

impl AlertsLog {
    pub fn new(enabled: bool, path: &str) -> Self {
        AlertsLog {
            path: enabled.then(|| PathBuf::from(path)),
            warned: false,
        }
    }

    /// Disabled logger (tests, lanes without alerting).
    pub fn disabled() -> Self {
        AlertsLog {
            path: None,
            warned: false,
        }
    }

    pub fn record(&mut self, event: &EventRecord) {
        let Some(path) = &self.path else {
            return;
        };

        let line = format_line(event);
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{}", line));

        if let Err(e) = result {
            if !self.warned {
                warn!(path = %path.display(), error = %e, "cannot write alerts file");
                self.warned = true;
            }
        }
    }
}

fn format_line(event: &EventRecord) -> String {
    format!(
        "{} {} {} {} \"{}\" {}",
        event.timestamp,
        event.location,
        event.message_id,
        event.severity,
        event.message,
        event.origin_of_condition,
    )
}
