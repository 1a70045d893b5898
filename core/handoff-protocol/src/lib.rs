//! On-disk artifact schemas for the handoff monitor.
//!
//! This crate is shared by the daemon, the CLI, and external observers to
//! prevent schema drift. Artifacts are JSON with camelCase keys because the
//! router and dashboards that consume them predate this workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const HEARTBEAT_FILE: &str = "heartbeat.json";
pub const STATUS_FILE: &str = "status.json";
pub const ROUTING_FILE: &str = "routing.json";
pub const LIMIT_FLAG_FILE: &str = "limit_reached.flag";
pub const RESUME_DIRECTIVE_FILE: &str = "resume-prompt.md";
pub const WORK_STATE_PREFIX: &str = "work-state-";

// ═══════════════════════════════════════════════════════════════════════════════
// Session State
// ═══════════════════════════════════════════════════════════════════════════════

/// Monitor-level view of the assistant session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Unknown,
    Active,
    ApproachingLimit,
    LimitReached,
    Fallback,
    ResetPending,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unknown => "unknown",
            SessionState::Active => "active",
            SessionState::ApproachingLimit => "approaching_limit",
            SessionState::LimitReached => "limit_reached",
            SessionState::Fallback => "fallback",
            SessionState::ResetPending => "reset_pending",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse status string published for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Active,
    TokenLimitApproaching,
    TokenLimitReached,
    FallbackMode,
    ResetPending,
    SessionExpired,
    Unknown,
    Error,
}

impl From<SessionState> for OverallStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Unknown => OverallStatus::Unknown,
            SessionState::Active => OverallStatus::Active,
            SessionState::ApproachingLimit => OverallStatus::TokenLimitApproaching,
            SessionState::LimitReached => OverallStatus::TokenLimitReached,
            SessionState::Fallback => OverallStatus::FallbackMode,
            SessionState::ResetPending => OverallStatus::ResetPending,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Heartbeat Artifact
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Active,
    Idle,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    /// Resident memory in bytes.
    pub memory_usage: u64,
    pub port: u16,
}

/// Liveness attestation written after a positive consensus verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatArtifact {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub token_estimate: u64,
    pub status: HeartbeatStatus,
    pub process_info: ProcessInfo,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Artifact
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Recommendations {
    pub use_local_models: bool,
    #[serde(rename = "forceMCP")]
    pub force_mcp: bool,
    pub message: String,
}

impl Recommendations {
    pub fn for_fallback(fallback: bool) -> Self {
        if fallback {
            Recommendations {
                use_local_models: true,
                force_mcp: true,
                message: "Assistant unavailable - use only local models".to_string(),
            }
        } else {
            Recommendations {
                use_local_models: false,
                force_mcp: false,
                message: "Assistant session active - use normally".to_string(),
            }
        }
    }

    pub fn session_expired() -> Self {
        Recommendations {
            use_local_models: true,
            force_mcp: true,
            message: "Session expired - use only local models until reset".to_string(),
        }
    }
}

/// Full status document as read by observers.
///
/// Writers never build this directly; they merge a [`StatusUpdate`] into
/// whatever is on disk so fields owned by other writers survive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusArtifact {
    pub status: OverallStatus,
    #[serde(default)]
    pub fallback_mode: bool,
    pub last_update: DateTime<Utc>,
    #[serde(default, rename = "mcpAvailable")]
    pub mcp_available: bool,
    #[serde(default)]
    pub ollama_available: bool,
    #[serde(default)]
    pub open_router_available: bool,
    #[serde(default)]
    pub session_state: SessionState,
    #[serde(default)]
    pub token_limit_reached: bool,
    #[serde(default)]
    pub recommendations: Recommendations,
}

/// Partial status write. `None` fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OverallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mcpAvailable")]
    pub mcp_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ollama_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_router_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_limit_reached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Recommendations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Drops a stored `warning` before merging.
    #[serde(skip)]
    pub clear_warning: bool,
}

impl StatusUpdate {
    /// Merges this update into `existing`, last writer wins per key.
    /// Non-object documents are replaced.
    pub fn merge_into(&self, existing: Value, now: DateTime<Utc>) -> Value {
        let mut object = match existing {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if self.clear_warning {
            object.remove("warning");
        }

        if let Ok(Value::Object(update)) = serde_json::to_value(self) {
            for (key, value) in update {
                object.insert(key, value);
            }
        }
        object.insert(
            "lastUpdate".to_string(),
            Value::String(now.to_rfc3339()),
        );

        if !object.contains_key("status") {
            object.insert(
                "status".to_string(),
                serde_json::to_value(OverallStatus::Unknown).unwrap_or(Value::Null),
            );
        }

        Value::Object(object)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Routing Flag
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared flag consumed by the request router.
/// `localOnly = true` forbids delegating work to the monitored assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingFlag {
    pub local_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Work-State Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    #[serde(default)]
    pub modified_files: Vec<String>,
    #[serde(default)]
    pub last_commit: Option<String>,
    #[serde(default)]
    pub current_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextAction {
    pub description: String,
}

/// Recoverable context captured when the assistant becomes unavailable.
/// Written once per save and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkStateSnapshot {
    pub session_id: String,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub current_task: Value,
    #[serde(default)]
    pub pending_operations: Vec<Value>,
    #[serde(default)]
    pub project_state: ProjectState,
    #[serde(default)]
    pub next_actions: Vec<NextAction>,
}
