//! Combines probe outcomes into a single activity verdict.
//!
//! `confidence = active / probes` and the verdict is positive once at least
//! `min_active` probes agree. A positive verdict backed by both a live process
//! and a listening port refreshes the heartbeat artifact, which the heartbeat
//! probe reads on later ticks. Without that evidence the heartbeat is left to
//! go stale so it cannot keep the verdict alive on its own.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use handoff_protocol::{HeartbeatArtifact, HeartbeatStatus, ProcessInfo};

use crate::artifacts::write_heartbeat;
use crate::signals::{ActivitySignal, ProbeOutcome, SignalCollector, SignalDetail, SignalSource};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    pub is_active: bool,
    /// Always in `[0, 1]`.
    pub confidence: f64,
    /// Signals from probes that settled, active or not.
    pub contributing_signals: Vec<ActivitySignal>,
    /// Probes that failed or timed out.
    pub failed: Vec<SignalSource>,
    pub observed_at: DateTime<Utc>,
}

impl ConsensusResult {
    pub fn from_outcomes(
        outcomes: Vec<ProbeOutcome>,
        min_active: usize,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let probe_count = outcomes.len();
        let mut contributing_signals = Vec::with_capacity(probe_count);
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.signal {
                Some(signal) => contributing_signals.push(signal),
                None => failed.push(outcome.source),
            }
        }

        let active_count = contributing_signals.iter().filter(|s| s.active).count();
        let confidence = if probe_count == 0 {
            0.0
        } else {
            (active_count as f64 / probe_count as f64).clamp(0.0, 1.0)
        };

        Self {
            is_active: probe_count > 0 && active_count >= min_active,
            confidence,
            contributing_signals,
            failed,
            observed_at,
        }
    }

    /// Verdict used before the first tick has run.
    pub fn unknown(observed_at: DateTime<Utc>) -> Self {
        Self {
            is_active: false,
            confidence: 0.0,
            contributing_signals: Vec::new(),
            failed: Vec::new(),
            observed_at,
        }
    }

    pub fn active_count(&self) -> usize {
        self.contributing_signals.iter().filter(|s| s.active).count()
    }

    /// True when no probe settled at all. Distinct from "every probe said no".
    pub fn is_unavailable(&self) -> bool {
        self.contributing_signals.is_empty()
    }

    pub fn signal(&self, source: SignalSource) -> Option<&ActivitySignal> {
        self.contributing_signals
            .iter()
            .find(|signal| signal.source == source)
    }

    /// Process metadata for the heartbeat. `None` unless the process probe
    /// found a pid and the port probe found a listener.
    pub fn observed_process(&self) -> Option<ProcessInfo> {
        let record = match self.signal(SignalSource::Process) {
            Some(ActivitySignal {
                active: true,
                detail: SignalDetail::Process(record),
                ..
            }) if record.pid > 0 => record,
            _ => return None,
        };
        let port = match self.signal(SignalSource::Port) {
            Some(ActivitySignal {
                active: true,
                detail: SignalDetail::Port { port, .. },
                ..
            }) => *port,
            _ => return None,
        };
        Some(ProcessInfo {
            pid: record.pid,
            memory_usage: record.memory_bytes,
            port,
        })
    }
}

/// Runs the collector and maintains the heartbeat for one monitor session.
pub struct ConsensusEngine {
    collector: SignalCollector,
    min_active: usize,
    heartbeat_path: PathBuf,
    session_id: String,
}

impl ConsensusEngine {
    pub fn new(collector: SignalCollector, min_active: usize, heartbeat_path: PathBuf) -> Self {
        Self {
            collector,
            min_active,
            heartbeat_path,
            session_id: generate_session_id(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn evaluate(&self, now: DateTime<Utc>, token_estimate: u64) -> ConsensusResult {
        let outcomes = self.collector.collect(now);
        let result = ConsensusResult::from_outcomes(outcomes, self.min_active, now);

        debug!(
            active = result.active_count(),
            failed = result.failed.len(),
            confidence = result.confidence,
            is_active = result.is_active,
            "Consensus evaluated"
        );

        if !result.is_active {
            return result;
        }
        let Some(process_info) = result.observed_process() else {
            debug!("Verdict active without process and port evidence; heartbeat not refreshed");
            return result;
        };

        let heartbeat = HeartbeatArtifact {
            timestamp: now,
            session_id: self.session_id.clone(),
            token_estimate,
            status: HeartbeatStatus::Active,
            process_info,
        };
        if let Err(err) = write_heartbeat(&self.heartbeat_path, &heartbeat) {
            warn!(error = %err, path = %self.heartbeat_path.display(), "Failed to write heartbeat");
        }

        result
    }
}

pub fn generate_session_id() -> String {
    format!("session-{}", ulid::Ulid::new().to_string().to_lowercase())
}
