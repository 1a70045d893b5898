//! Crash-loop guard: repeated starts inside a short window delay startup.

use chrono::{DateTime, Utc};
use handoff_core::{read_json_value, write_json_atomic};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::thread;
use std::time::Duration as StdDuration;
use tracing::warn;

const WINDOW_SECS: i64 = 120;
const MAX_STARTS: usize = 3;
const BACKOFF_STEP_SECS: u64 = 10;
const BACKOFF_MAX_SECS: u64 = 60;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StartHistory {
    starts: Vec<DateTime<Utc>>,
}

pub fn apply_startup_backoff(path: &Path) {
    let now = Utc::now();
    let mut history = load_history(path);
    let delay = record_start(now, &mut history);

    if let Err(err) = write_json_atomic(path, &history) {
        warn!(error = %err, path = %path.display(), "Failed to persist start history");
    }

    if let Some(secs) = delay {
        warn!(
            starts = history.starts.len(),
            backoff_secs = secs,
            "Monitor restarting too often; delaying startup"
        );
        thread::sleep(StdDuration::from_secs(secs));
    }
}

/// Records `now` and returns the delay owed, if any.
fn record_start(now: DateTime<Utc>, history: &mut StartHistory) -> Option<u64> {
    history
        .starts
        .retain(|at| now.signed_duration_since(*at).num_seconds() <= WINDOW_SECS);
    history.starts.push(now);

    let extra = history.starts.len().checked_sub(MAX_STARTS + 1)? as u64 + 1;
    Some(BACKOFF_STEP_SECS.saturating_mul(extra).min(BACKOFF_MAX_SECS))
}

fn load_history(path: &Path) -> StartHistory {
    match read_json_value(path) {
        Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
        Ok(None) => StartHistory::default(),
        Err(err) => {
            warn!(error = %err, "Start history unreadable; starting fresh");
            StartHistory::default()
        }
    }
}
