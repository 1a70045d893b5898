//! # handoff-core
//!
//! Watches an external AI assistant process, decides whether it is usable,
//! and steers work toward local backends when it is not.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Probes run on threads against a
//!   shared deadline; timers run through [`Scheduler`] one at a time.
//! - **Injectable**: Every external effect (process table, ports, commands,
//!   clock, backends) sits behind a trait so tests can script it.
//! - **Graceful degradation**: Missing or corrupt artifacts read as absent,
//!   failed probes count as "no signal", and I/O failures are logged rather
//!   than stopping the monitor.
//! - **Artifacts are the interface**: Observers only read the JSON files
//!   defined in `handoff-protocol`.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use handoff_core::{load_config, Monitor, MonitorDeps, StorageConfig};
//!
//! let storage = StorageConfig::from_env()?;
//! let config = load_config(&storage.config_file())?;
//! let deps = MonitorDeps::standard(&config, &storage);
//! let mut monitor = Monitor::new(config, storage, deps);
//! monitor.start();
//! monitor.run_due();
//! ```

pub mod actions;
pub mod artifacts;
pub mod clock;
pub mod command;
pub mod config;
pub mod consensus;
pub mod error;
pub mod log_detector;
pub mod machine;
pub mod monitor;
pub mod patterns;
pub mod persistence;
pub mod process;
pub mod reconcile;
pub mod signals;
pub mod storage;
pub mod usage;

pub use actions::ArtifactActions;
pub use artifacts::*;
pub use clock::{Clock, FakeClock, Scheduler, SystemClock};
pub use config::*;
pub use consensus::{generate_session_id, ConsensusEngine, ConsensusResult};
pub use error::{HandoffError, Result};
pub use log_detector::{
    discover_log, CommandResetProbe, DetectionWindow, LimitEvent, LimitOrigin, LogLimitDetector,
    ResetCheck, ResetProbe,
};
pub use machine::{
    entry_actions, evaluate_rule, EntryAction, MachineThresholds, SessionStateMachine,
    SessionTransition, StateActions,
};
pub use monitor::{Monitor, MonitorDeps, MonitorTask};
pub use patterns::contains_limit_phrase;
pub use persistence::{
    compose_resume_directive, write_resume_directive, GitWorkStateSource, WorkStatePersistence,
    WorkStateSource,
};
pub use process::{find_target, inspector_for, ProcessInspector, ProcessRecord};
pub use reconcile::{
    status_update_for, BackendAvailability, BackendHealth, Backends, ReconciliationLoop,
};
pub use signals::{
    ActivitySignal, Probe, ProbeOutcome, SignalCollector, SignalDetail, SignalSource,
};
pub use storage::*;
pub use usage::{TokenUsageEstimator, TokenUsageSnapshot, TokenWarning, UsageReport, WarningLevel};
