//! The monitor: owns every component and drives them from one scheduler.
//!
//! Four timers share the scheduler: consensus, log scan, reconciliation, and
//! the reset-wait probe (enabled only while a confirmed limit is pending).
//! Callbacks run one at a time on the caller's thread, so state-machine
//! updates never overlap.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use handoff_protocol::{SessionState, StatusUpdate};

use crate::actions::ArtifactActions;
use crate::artifacts::{marker_exists, remove_heartbeat};
use crate::clock::{Clock, Scheduler, SystemClock};
use crate::config::MonitorConfig;
use crate::consensus::{ConsensusEngine, ConsensusResult};
use crate::log_detector::{discover_log, CommandResetProbe, LimitEvent, LogLimitDetector, ResetCheck, ResetProbe};
use crate::machine::{MachineThresholds, SessionStateMachine, SessionTransition};
use crate::persistence::{compose_resume_directive, write_resume_directive, GitWorkStateSource, WorkStateSource};
use crate::process::{inspector_for, ProcessInspector};
use crate::reconcile::{status_update_for, Backends, ReconciliationLoop};
use crate::signals::SignalCollector;
use crate::storage::StorageConfig;
use crate::usage::{TokenUsageEstimator, UsageReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTask {
    Consensus,
    LogScan,
    Reconcile,
    ResetProbe,
}

/// Replaceable collaborators. [`MonitorDeps::standard`] wires the real ones.
pub struct MonitorDeps {
    pub clock: Arc<dyn Clock>,
    pub collector: SignalCollector,
    pub process_inspector: Arc<dyn ProcessInspector>,
    pub reset_probe: Option<Box<dyn ResetProbe>>,
    pub work_source: Box<dyn WorkStateSource>,
    pub backends: Backends,
    pub log_path: Option<PathBuf>,
}

impl MonitorDeps {
    pub fn standard(config: &MonitorConfig, storage: &StorageConfig) -> Self {
        let timeout = config.consensus.probe_timeout();
        let log_path = config
            .log_detector
            .log_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| discover_log(&storage.log_search_dirs()));

        Self {
            clock: Arc::new(SystemClock),
            collector: SignalCollector::standard(&config.consensus, storage),
            process_inspector: inspector_for(config.consensus.process_inspector, timeout),
            reset_probe: CommandResetProbe::from_config(&config.log_detector)
                .map(|probe| Box::new(probe) as Box<dyn ResetProbe>),
            work_source: Box::new(GitWorkStateSource::new(
                storage.project_dir().to_path_buf(),
                storage.current_task_file(),
                timeout,
            )),
            backends: Backends::from_config(&config.backends),
            log_path,
        }
    }
}

pub struct Monitor {
    config: MonitorConfig,
    storage: StorageConfig,
    clock: Arc<dyn Clock>,
    scheduler: Scheduler<MonitorTask>,
    engine: ConsensusEngine,
    estimator: TokenUsageEstimator,
    detector: LogLimitDetector,
    machine: SessionStateMachine<ArtifactActions>,
    reconciler: ReconciliationLoop,
    reset_probe: Option<Box<dyn ResetProbe>>,
    last_consensus: ConsensusResult,
    last_usage: Option<UsageReport>,
    last_resume: Option<PathBuf>,
    stop_requested: Arc<AtomicBool>,
    running: bool,
}

impl Monitor {
    pub fn new(config: MonitorConfig, storage: StorageConfig, deps: MonitorDeps) -> Self {
        let engine = ConsensusEngine::new(
            deps.collector,
            config.consensus.min_active,
            storage.heartbeat_file(),
        );
        let actions = ArtifactActions::new(&storage, deps.work_source, engine.session_id().to_string());
        let thresholds = MachineThresholds {
            fallback_confidence: config.consensus.fallback_confidence,
            warn: config.usage.warn_threshold,
            critical: config.usage.critical_threshold,
        };
        let detector = LogLimitDetector::new(
            &config.log_detector,
            deps.log_path,
            storage.limit_flag_file(),
            deps.process_inspector,
            config.consensus.process_markers.clone(),
        );
        let now = deps.clock.now();

        Self {
            estimator: TokenUsageEstimator::new(config.usage.clone(), &storage),
            machine: SessionStateMachine::new(thresholds, config.history_cap, actions),
            reconciler: ReconciliationLoop::new(&storage, deps.backends),
            scheduler: Scheduler::new(),
            clock: deps.clock,
            reset_probe: deps.reset_probe,
            last_consensus: ConsensusResult::unknown(now),
            last_usage: None,
            last_resume: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            running: false,
            engine,
            detector,
            config,
            storage,
        }
    }

    /// Flag that, once set, makes the monitor discard in-flight results.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn is_fallback(&self) -> bool {
        self.machine.is_fallback()
    }

    pub fn is_assistant_available(&self) -> bool {
        self.machine.is_assistant_available()
    }

    pub fn history(&self) -> Vec<SessionTransition> {
        self.machine.history()
    }

    pub fn session_id(&self) -> &str {
        self.engine.session_id()
    }

    pub fn detector(&self) -> &LogLimitDetector {
        &self.detector
    }

    pub fn last_consensus(&self) -> &ConsensusResult {
        &self.last_consensus
    }

    pub fn last_resume_directive(&self) -> Option<&PathBuf> {
        self.last_resume.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_task_enabled(&self, task: MonitorTask) -> bool {
        self.scheduler.is_enabled(task)
    }

    /// Prepares storage, clears warning markers for the new session, and
    /// registers the timers.
    pub fn start(&mut self) {
        let now = self.clock.now();
        if let Err(err) = self.storage.ensure_dirs() {
            warn!(error = %err, root = %self.storage.root().display(), "Failed to create storage dirs");
        }
        if let Err(err) = self.estimator.reset_warning_markers() {
            warn!(error = %err, "Failed to reset warning markers");
        }

        let intervals = &self.config.intervals;
        let log_interval = if self.detector.is_degraded() {
            intervals.degraded_scan_secs
        } else {
            intervals.log_scan_secs
        };
        self.scheduler.add(MonitorTask::Consensus, Duration::from_secs(intervals.consensus_secs));
        self.scheduler.add(MonitorTask::LogScan, Duration::from_secs(log_interval));
        self.scheduler.add(MonitorTask::Reconcile, Duration::from_secs(intervals.reconcile_secs));
        self.scheduler
            .add_disabled(MonitorTask::ResetProbe, Duration::from_secs(intervals.reset_probe_secs));

        // A limit confirmed before a restart is still pending.
        if !self.detector.is_degraded() && marker_exists(&self.storage.limit_flag_file()) {
            info!("Limit flag present at startup; resuming reset wait");
            self.detector.resume_waiting();
            self.machine.confirm_limit("limit flag present at startup", now);
            self.scheduler.enable(MonitorTask::ResetProbe, now);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.running = true;
        info!(
            session_id = %self.engine.session_id(),
            degraded = self.detector.is_degraded(),
            "Monitor started"
        );
    }

    /// Runs every task due now. Returns what ran.
    pub fn run_due(&mut self) -> Vec<MonitorTask> {
        if !self.running {
            return Vec::new();
        }
        let now = self.clock.now();
        let due = self.scheduler.due(now);
        for task in &due {
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            self.run_task(*task, now);
        }
        due
    }

    /// Time until the next task is due, `None` once stopped.
    pub fn until_next(&self) -> Option<Duration> {
        if !self.running {
            return None;
        }
        self.scheduler.until_next(self.clock.now())
    }

    pub fn run_task(&mut self, task: MonitorTask, now: DateTime<Utc>) {
        match task {
            MonitorTask::Consensus => self.consensus_tick(now),
            MonitorTask::LogScan => self.log_tick(now),
            MonitorTask::Reconcile => self.reconcile_tick(now),
            MonitorTask::ResetProbe => self.reset_tick(now),
        }
    }

    /// Clears every timer and deletes the heartbeat.
    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.scheduler.clear();
        self.running = false;
        match remove_heartbeat(&self.storage.heartbeat_file()) {
            Ok(_) => info!("Monitor stopped"),
            Err(err) => warn!(error = %err, "Failed to remove heartbeat on stop"),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Ticks
    // ─────────────────────────────────────────────────────────────────────────────

    fn consensus_tick(&mut self, now: DateTime<Utc>) {
        let token_estimate = self.last_usage.as_ref().map(UsageReport::total).unwrap_or(0);
        let consensus = self.engine.evaluate(now, token_estimate);
        if self.stop_requested.load(Ordering::SeqCst) {
            debug!("Discarding consensus result after stop");
            return;
        }

        let usage = self
            .estimator
            .evaluate(&consensus, self.config.consensus.fallback_confidence);
        if usage.warning.should_warn {
            warn!(message = %usage.warning.message, "Token usage warning");
        } else {
            debug!(message = %usage.warning.message, "Token usage");
        }

        self.machine.tick(&consensus, &usage, now);
        self.last_consensus = consensus;
        self.last_usage = Some(usage);
    }

    fn log_tick(&mut self, now: DateTime<Utc>) {
        if let Some(event) = self.detector.scan(now) {
            self.on_limit_confirmed(event);
        }
    }

    fn on_limit_confirmed(&mut self, event: LimitEvent) {
        let now = event.at;
        let reason = format!("usage limit confirmed ({:?})", event.origin);

        self.machine.actions_mut().save_snapshot(now, &reason);
        self.machine.confirm_limit(reason, now);

        let update = StatusUpdate {
            reason: Some("usage limit confirmed".to_string()),
            ..status_update_for(SessionState::ResetPending)
        };
        self.machine.actions().merge_status(&update, now);

        self.scheduler.enable(MonitorTask::ResetProbe, now);
    }

    fn reconcile_tick(&mut self, now: DateTime<Utc>) {
        if let Err(err) = self
            .reconciler
            .reconcile(self.machine.state(), self.machine.routes_local_only(), now)
        {
            warn!(error = %err, "Reconciliation failed");
        }
    }

    fn reset_tick(&mut self, now: DateTime<Utc>) {
        let Some(probe) = self.reset_probe.as_deref() else {
            warn!("No reset probe configured; limit wait cannot end automatically");
            self.scheduler.disable(MonitorTask::ResetProbe);
            return;
        };

        match self.detector.check_reset(probe) {
            ResetCheck::Reset => {
                self.scheduler.disable(MonitorTask::ResetProbe);
                self.machine.clear_reset_pending(now);
                if let Err(err) = self.estimator.reset_warning_markers() {
                    warn!(error = %err, "Failed to reset warning markers");
                }
                self.last_resume = self.generate_resume_directive();
            }
            ResetCheck::NotWaiting => self.scheduler.disable(MonitorTask::ResetProbe),
            ResetCheck::StillLimited => {}
        }
    }

    /// Renders the resume directive from the latest snapshot and writes it.
    pub fn generate_resume_directive(&self) -> Option<PathBuf> {
        let Some(snapshot) = self.machine.actions().persistence().load_last() else {
            warn!("No saved work state to resume from");
            return None;
        };

        let directive = compose_resume_directive(&snapshot);
        let path = self.storage.resume_directive_file();
        match write_resume_directive(&path, &directive) {
            Ok(()) => {
                info!(path = %path.display(), session_id = %snapshot.session_id, "Resume directive written");
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, path = %path.display(), "Failed to write resume directive");
                None
            }
        }
    }
}
