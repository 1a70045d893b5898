//! Liveness probes and their concurrent collection.
//!
//! Each probe is an isolated check that either settles with an
//! [`ActivitySignal`] (active or not) or fails. Failures and timeouts are
//! reported as absent signals; they never abort the other probes.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::artifacts::read_heartbeat;
use crate::command::run_with_timeout;
use crate::config::ConsensusConfig;
use crate::error::{HandoffError, Result};
use crate::process::{find_target, inspector_for, ProcessInspector, ProcessRecord};
use crate::storage::StorageConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Process,
    Port,
    Config,
    Heartbeat,
}

impl SignalSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalSource::Process => "process",
            SignalSource::Port => "port",
            SignalSource::Config => "config",
            SignalSource::Heartbeat => "heartbeat",
        }
    }
}

/// What a probe saw, kept for heartbeat metadata and diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalDetail {
    Process(ProcessRecord),
    Port {
        port: u16,
        owner: String,
    },
    Config {
        path: PathBuf,
        modified: Option<DateTime<Utc>>,
    },
    Heartbeat {
        session_id: String,
        age_secs: i64,
    },
    /// Probe ran and found nothing.
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActivitySignal {
    pub source: SignalSource,
    pub observed_at: DateTime<Utc>,
    pub active: bool,
    pub detail: SignalDetail,
}

impl ActivitySignal {
    fn inactive(source: SignalSource, observed_at: DateTime<Utc>) -> Self {
        Self {
            source,
            observed_at,
            active: false,
            detail: SignalDetail::Nothing,
        }
    }
}

pub trait Probe: Send + Sync {
    fn source(&self) -> SignalSource;
    fn probe(&self, now: DateTime<Utc>) -> Result<ActivitySignal>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Process Probe
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ProcessProbe {
    inspector: Arc<dyn ProcessInspector>,
    markers: Vec<String>,
}

impl ProcessProbe {
    pub fn new(inspector: Arc<dyn ProcessInspector>, markers: Vec<String>) -> Self {
        Self { inspector, markers }
    }
}

impl Probe for ProcessProbe {
    fn source(&self) -> SignalSource {
        SignalSource::Process
    }

    fn probe(&self, now: DateTime<Utc>) -> Result<ActivitySignal> {
        let records = self.inspector.list()?;
        let Some(target) = find_target(&records, &self.markers) else {
            return Ok(ActivitySignal::inactive(SignalSource::Process, now));
        };

        if target.start_time.is_none() {
            return Err(HandoffError::ProbeInvalid {
                probe: SignalSource::Process.as_str().to_string(),
                details: format!("unparsable start time for pid {}", target.pid),
            });
        }

        Ok(ActivitySignal {
            source: SignalSource::Process,
            observed_at: now,
            active: true,
            detail: SignalDetail::Process(target),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Port Probe
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortListener {
    pub pid: Option<u32>,
    pub command: String,
}

pub trait PortInspector: Send + Sync {
    fn listeners(&self, port: u16) -> Result<Vec<PortListener>>;
}

/// Uses `lsof` field output (`-Fpc`): `p<pid>` lines followed by `c<command>`.
#[derive(Debug, Clone)]
pub struct LsofInspector {
    timeout: Duration,
}

impl LsofInspector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl PortInspector for LsofInspector {
    fn listeners(&self, port: u16) -> Result<Vec<PortListener>> {
        let target = format!(":{}", port);
        let output = run_with_timeout("lsof", &["-nP", "-i", &target, "-Fpc"], None, self.timeout)?;
        // lsof exits 1 with no output when nothing holds the port.
        if !output.success && output.stdout.trim().is_empty() {
            if output.stderr.trim().is_empty() {
                return Ok(Vec::new());
            }
            return Err(HandoffError::CommandFailed {
                command: format!("lsof -nP -i {} -Fpc", target),
                details: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_lsof_fields(&output.stdout))
    }
}

pub fn parse_lsof_fields(output: &str) -> Vec<PortListener> {
    let mut listeners = Vec::new();
    let mut pid = None;
    for line in output.lines() {
        let Some(tag) = line.chars().next() else {
            continue;
        };
        let value = &line[tag.len_utf8()..];
        match tag {
            'p' => pid = value.parse::<u32>().ok(),
            'c' => listeners.push(PortListener {
                pid,
                command: value.to_string(),
            }),
            _ => {}
        }
    }
    listeners
}

pub struct PortProbe {
    inspector: Arc<dyn PortInspector>,
    /// Default port first, then alternates.
    ports: Vec<u16>,
    owner_markers: Vec<String>,
}

impl PortProbe {
    pub fn new(inspector: Arc<dyn PortInspector>, ports: Vec<u16>, owner_markers: Vec<String>) -> Self {
        Self {
            inspector,
            ports,
            owner_markers: owner_markers.iter().map(|m| m.to_lowercase()).collect(),
        }
    }

    fn plausible_owner(&self, listener: &PortListener) -> bool {
        let command = listener.command.to_lowercase();
        self.owner_markers.iter().any(|marker| command.contains(marker))
    }
}

impl Probe for PortProbe {
    fn source(&self) -> SignalSource {
        SignalSource::Port
    }

    fn probe(&self, now: DateTime<Utc>) -> Result<ActivitySignal> {
        let mut last_error = None;
        let mut checked = 0usize;

        for &port in &self.ports {
            let listeners = match self.inspector.listeners(port) {
                Ok(listeners) => listeners,
                Err(err) => {
                    debug!(port, error = %err, "Port check failed");
                    last_error = Some(err);
                    continue;
                }
            };
            checked += 1;

            if let Some(owner) = listeners.iter().find(|l| self.plausible_owner(l)) {
                return Ok(ActivitySignal {
                    source: SignalSource::Port,
                    observed_at: now,
                    active: true,
                    detail: SignalDetail::Port {
                        port,
                        owner: owner.command.clone(),
                    },
                });
            }
        }

        match (checked, last_error) {
            (0, Some(err)) => Err(err),
            _ => Ok(ActivitySignal::inactive(SignalSource::Port, now)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Config Probe
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ConfigProbe {
    files: Vec<PathBuf>,
}

impl ConfigProbe {
    pub fn new(files: Vec<PathBuf>) -> Self {
        Self { files }
    }
}

impl Probe for ConfigProbe {
    fn source(&self) -> SignalSource {
        SignalSource::Config
    }

    fn probe(&self, now: DateTime<Utc>) -> Result<ActivitySignal> {
        for path in &self.files {
            let Ok(metadata) = fs_err::metadata(path) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
            return Ok(ActivitySignal {
                source: SignalSource::Config,
                observed_at: now,
                active: true,
                detail: SignalDetail::Config {
                    path: path.clone(),
                    modified,
                },
            });
        }
        Ok(ActivitySignal::inactive(SignalSource::Config, now))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Heartbeat Probe
// ═══════════════════════════════════════════════════════════════════════════════

pub struct HeartbeatProbe {
    path: PathBuf,
    stale_after: chrono::Duration,
}

impl HeartbeatProbe {
    pub fn new(path: PathBuf, stale_after_secs: u64) -> Self {
        Self {
            path,
            stale_after: chrono::Duration::seconds(stale_after_secs as i64),
        }
    }
}

impl Probe for HeartbeatProbe {
    fn source(&self) -> SignalSource {
        SignalSource::Heartbeat
    }

    fn probe(&self, now: DateTime<Utc>) -> Result<ActivitySignal> {
        let Some(heartbeat) = read_heartbeat(&self.path)? else {
            return Ok(ActivitySignal::inactive(SignalSource::Heartbeat, now));
        };

        let age = now.signed_duration_since(heartbeat.timestamp);
        Ok(ActivitySignal {
            source: SignalSource::Heartbeat,
            observed_at: now,
            active: age < self.stale_after,
            detail: SignalDetail::Heartbeat {
                session_id: heartbeat.session_id,
                age_secs: age.num_seconds(),
            },
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Collection
// ═══════════════════════════════════════════════════════════════════════════════

/// One probe's settled result. `signal` is `None` when the probe failed or
/// did not settle before the deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub source: SignalSource,
    pub signal: Option<ActivitySignal>,
}

pub struct SignalCollector {
    probes: Vec<Arc<dyn Probe>>,
    timeout: Duration,
}

impl SignalCollector {
    pub fn new(probes: Vec<Arc<dyn Probe>>, timeout: Duration) -> Self {
        Self { probes, timeout }
    }

    /// The process, port, config and heartbeat probes wired to real backends.
    pub fn standard(config: &ConsensusConfig, storage: &StorageConfig) -> Self {
        let timeout = config.probe_timeout();
        let mut ports = vec![config.default_port];
        ports.extend(config.alternate_ports.iter().copied());

        let probes: Vec<Arc<dyn Probe>> = vec![
            Arc::new(ProcessProbe::new(
                inspector_for(config.process_inspector, timeout),
                config.process_markers.clone(),
            )),
            Arc::new(PortProbe::new(
                Arc::new(LsofInspector::new(timeout)),
                ports,
                config.port_owner_markers.clone(),
            )),
            Arc::new(ConfigProbe::new(storage.assistant_config_files())),
            Arc::new(HeartbeatProbe::new(
                storage.heartbeat_file(),
                config.heartbeat_stale_secs,
            )),
        ];

        Self::new(probes, timeout)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Runs every probe on its own thread and waits for all of them to settle
    /// or for the shared deadline. Late results are discarded.
    pub fn collect(&self, now: DateTime<Utc>) -> Vec<ProbeOutcome> {
        let (tx, rx) = mpsc::channel();
        for (index, probe) in self.probes.iter().enumerate() {
            let probe = Arc::clone(probe);
            let tx = tx.clone();
            thread::spawn(move || {
                let _ = tx.send((index, probe.probe(now)));
            });
        }
        drop(tx);

        let mut outcomes: Vec<ProbeOutcome> = self
            .probes
            .iter()
            .map(|probe| ProbeOutcome {
                source: probe.source(),
                signal: None,
            })
            .collect();

        let deadline = Instant::now() + self.timeout;
        let mut pending = self.probes.len();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((index, result)) => {
                    pending -= 1;
                    match result {
                        Ok(signal) => outcomes[index].signal = Some(signal),
                        Err(err) => {
                            debug!(probe = outcomes[index].source.as_str(), error = %err, "Probe failed")
                        }
                    }
                }
                Err(_) => {
                    debug!(pending, "Probes did not settle before deadline");
                    break;
                }
            }
        }

        outcomes
    }
}
