//! Runtime configuration for the monitor.
//!
//! Every threshold that drives a verdict lives here so it can be tuned
//! without a rebuild. Missing file or missing keys fall back to defaults.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HandoffError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub log_detector: LogDetectorConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default)]
    pub backends: BackendConfig,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

fn default_history_cap() -> usize {
    50
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusConfig::default(),
            usage: UsageConfig::default(),
            log_detector: LogDetectorConfig::default(),
            intervals: IntervalConfig::default(),
            backends: BackendConfig::default(),
            history_cap: default_history_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Probes that must report active for a positive verdict.
    pub min_active: usize,
    /// Below this confidence the assistant is treated as unavailable.
    pub fallback_confidence: f64,
    pub heartbeat_stale_secs: u64,
    pub default_port: u16,
    pub alternate_ports: Vec<u16>,
    /// Substrings matched against process names and command lines.
    pub process_markers: Vec<String>,
    /// Substrings that mark a port listener as plausibly ours.
    pub port_owner_markers: Vec<String>,
    pub probe_timeout_secs: u64,
    pub process_inspector: InspectorKind,
}

/// Backend used to enumerate processes for the process probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InspectorKind {
    #[default]
    Sysinfo,
    /// Parses `ps aux`; only for hosts where sysinfo misreports.
    Ps,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_active: 2,
            fallback_confidence: 0.4,
            heartbeat_stale_secs: 120,
            default_port: 54545,
            alternate_ports: vec![44545, 54546, 54547],
            process_markers: vec![
                "claude".to_string(),
                "@anthropic-ai/claude-code".to_string(),
            ],
            port_owner_markers: vec!["claude".to_string(), "node".to_string()],
            probe_timeout_secs: 5,
            process_inspector: InspectorKind::Sysinfo,
        }
    }
}

impl ConsensusConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub practical_limit: u64,
    pub warn_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            practical_limit: 160_000,
            warn_threshold: 0.75,
            critical_threshold: 0.90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogDetectorConfig {
    pub window_secs: u64,
    pub threshold: usize,
    pub reset_probe_command: Vec<String>,
    pub reset_probe_timeout_secs: u64,
    /// Explicit log file; skips discovery when set.
    pub log_path: Option<String>,
}

impl Default for LogDetectorConfig {
    fn default() -> Self {
        Self {
            window_secs: 15,
            threshold: 3,
            reset_probe_command: vec!["claude".to_string(), "--help".to_string()],
            reset_probe_timeout_secs: 30,
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub consensus_secs: u64,
    pub log_scan_secs: u64,
    pub reconcile_secs: u64,
    pub reset_probe_secs: u64,
    /// Poll cadence when no log file could be located.
    pub degraded_scan_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            consensus_secs: 30,
            log_scan_secs: 5,
            reconcile_secs: 30,
            reset_probe_secs: 300,
            degraded_scan_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub ollama_addr: String,
    pub mcp_server_path: Option<String>,
    pub openrouter_key_env: String,
    pub check_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            ollama_addr: "127.0.0.1:11434".to_string(),
            mcp_server_path: None,
            openrouter_key_env: "OPENROUTER_API_KEY".to_string(),
            check_timeout_ms: 4000,
        }
    }
}

impl BackendConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

/// Loads the monitor config. A missing file yields defaults.
pub fn load_config(path: &Path) -> Result<MonitorConfig> {
    if !path.exists() {
        return Ok(MonitorConfig::default());
    }

    let content = fs_err::read_to_string(path)
        .map_err(|err| HandoffError::io(format!("reading {}", path.display()), err))?;
    toml::from_str::<MonitorConfig>(&content).map_err(|err| HandoffError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
