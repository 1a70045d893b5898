//! Scripted collaborators for driving a `Monitor` without touching the host.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use handoff_core::{
    ActivitySignal, BackendHealth, Backends, FakeClock, HandoffError, MonitorConfig, MonitorDeps,
    Probe, ProcessInspector, ProcessRecord, ResetProbe, SignalCollector, SignalDetail,
    SignalSource, StorageConfig, WorkStateSource,
};
use handoff_protocol::{ProjectState, WorkStateSnapshot};
use serde_json::json;

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
        .expect("parse")
        .with_timezone(&Utc)
}

pub fn storage(root: &Path) -> StorageConfig {
    StorageConfig::with_roots(root.join(".handoff"), root.join(".claude"))
}

/// Probe whose answer can be flipped between ticks. `None` fails the probe.
/// Active process and port answers carry a pid and listener like the real
/// probes do.
pub struct ScriptedProbe {
    source: SignalSource,
    active: Mutex<Option<bool>>,
}

impl ScriptedProbe {
    pub fn new(source: SignalSource, active: Option<bool>) -> Arc<Self> {
        Arc::new(Self {
            source,
            active: Mutex::new(active),
        })
    }

    pub fn set(&self, active: Option<bool>) {
        if let Ok(mut guard) = self.active.lock() {
            *guard = active;
        }
    }
}

impl Probe for ScriptedProbe {
    fn source(&self) -> SignalSource {
        self.source
    }

    fn probe(&self, now: DateTime<Utc>) -> handoff_core::Result<ActivitySignal> {
        let active = self.active.lock().ok().and_then(|guard| *guard);
        match active {
            Some(active) => Ok(ActivitySignal {
                source: self.source,
                observed_at: now,
                active,
                detail: detail_for(self.source, active, now),
            }),
            None => Err(HandoffError::ProbeInvalid {
                probe: self.source.as_str().to_string(),
                details: "scripted failure".to_string(),
            }),
        }
    }
}

fn detail_for(source: SignalSource, active: bool, now: DateTime<Utc>) -> SignalDetail {
    match (source, active) {
        (SignalSource::Process, true) => SignalDetail::Process(ProcessRecord {
            pid: 4242,
            start_time: Some(now),
            memory_bytes: 64 * 1024 * 1024,
            command: "claude".to_string(),
        }),
        (SignalSource::Port, true) => SignalDetail::Port {
            port: 54545,
            owner: "node".to_string(),
        },
        _ => SignalDetail::Nothing,
    }
}

pub struct EmptyProcessTable;

impl ProcessInspector for EmptyProcessTable {
    fn list(&self) -> handoff_core::Result<Vec<ProcessRecord>> {
        Ok(Vec::new())
    }
}

/// Returns queued outputs in order, repeating the last one once drained.
/// Clones share the same script.
#[derive(Clone)]
pub struct ScriptedResetProbe {
    script: Arc<ResetScript>,
}

struct ResetScript {
    outputs: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Result<String, String>>,
    calls: AtomicUsize,
}

impl ScriptedResetProbe {
    pub fn new(outputs: Vec<Result<String, String>>) -> Self {
        Self {
            script: Arc::new(ResetScript {
                outputs: Mutex::new(outputs.into()),
                last: Mutex::new(Ok(String::new())),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn call_count(&self) -> usize {
        self.script.calls.load(Ordering::SeqCst)
    }
}

impl ResetProbe for ScriptedResetProbe {
    fn check(&self) -> Result<String, String> {
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .outputs
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        let mut last = match self.script.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(output) = next {
            *last = output;
        }
        last.clone()
    }
}

pub struct FixedSource;

impl WorkStateSource for FixedSource {
    fn capture(&self, session_id: &str, now: DateTime<Utc>) -> WorkStateSnapshot {
        WorkStateSnapshot {
            session_id: session_id.to_string(),
            last_active: now,
            current_task: json!({"description": "wire up the reset probe"}),
            pending_operations: Vec::new(),
            project_state: ProjectState {
                current_branch: Some("main".to_string()),
                last_commit: Some("abc1234 Add monitor".to_string()),
                modified_files: vec!["src/monitor.rs".to_string()],
            },
            next_actions: Vec::new(),
        }
    }
}

pub struct Offline(pub &'static str);

impl BackendHealth for Offline {
    fn name(&self) -> &'static str {
        self.0
    }

    fn available(&self) -> bool {
        false
    }
}

pub fn offline_backends() -> Backends {
    Backends {
        ollama: Box::new(Offline("ollama")),
        mcp: Box::new(Offline("mcp")),
        open_router: Box::new(Offline("openrouter")),
    }
}

pub struct Harness {
    pub clock: FakeClock,
    pub probes: Vec<Arc<ScriptedProbe>>,
    pub reset_probe: ScriptedResetProbe,
}

impl Harness {
    /// Four probes (process, port, config, heartbeat) all answering `active`.
    pub fn new(active: Option<bool>, reset_outputs: Vec<Result<String, String>>) -> Self {
        let probes = [
            SignalSource::Process,
            SignalSource::Port,
            SignalSource::Config,
            SignalSource::Heartbeat,
        ]
        .into_iter()
        .map(|source| ScriptedProbe::new(source, active))
        .collect();
        Self {
            clock: FakeClock::new(start_time()),
            probes,
            reset_probe: ScriptedResetProbe::new(reset_outputs),
        }
    }

    pub fn set_all(&self, active: Option<bool>) {
        for probe in &self.probes {
            probe.set(active);
        }
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }

    pub fn deps(&self, log_path: Option<std::path::PathBuf>) -> MonitorDeps {
        let probes: Vec<Arc<dyn Probe>> = self
            .probes
            .iter()
            .map(|probe| Arc::clone(probe) as Arc<dyn Probe>)
            .collect();
        MonitorDeps {
            clock: Arc::new(self.clock.clone()),
            collector: SignalCollector::new(probes, Duration::from_secs(2)),
            process_inspector: Arc::new(EmptyProcessTable),
            reset_probe: Some(Box::new(self.reset_probe.clone())),
            work_source: Box::new(FixedSource),
            backends: offline_backends(),
            log_path,
        }
    }
}

pub fn config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.log_detector.window_secs = 10;
    config.log_detector.threshold = 3;
    config
}
