//! Subcommand implementations. Each returns what `main` prints.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

use handoff_core::{
    compose_resume_directive, create_marker, generate_session_id, limit_flag_message,
    marker_exists, merge_status, read_heartbeat, read_json_value, read_routing_flag,
    remove_marker, status_update_for, write_resume_directive, write_routing_flag,
    GitWorkStateSource, MonitorConfig, StorageConfig, TokenUsageEstimator, WorkStatePersistence,
    WorkStateSource,
};
use handoff_protocol::{SessionState, StatusUpdate};

/// Status artifact plus routing, limit flag and latest snapshot. A missing
/// or unreadable artifact reads as an `error` status that advises normal use.
pub fn status_report(storage: &StorageConfig) -> Value {
    let mut report = match read_json_value(&storage.status_file()) {
        Ok(Some(Value::Object(map))) => Value::Object(map),
        _ => json!({
            "status": "error",
            "fallbackMode": false,
            "recommendations": {
                "useLocalModels": false,
                "forceMCP": false,
                "message": "Status unavailable - use normally"
            }
        }),
    };

    let local_only = read_routing_flag(&storage.routing_file())
        .ok()
        .flatten()
        .map(|flag| flag.local_only);
    let persistence = WorkStatePersistence::new(storage.backups_dir());
    let latest = persistence.list().pop();
    let snapshot = persistence.load_last();

    report["routing"] = json!({ "localOnly": local_only });
    report["limitFlag"] = json!(marker_exists(&storage.limit_flag_file()));
    report["latestSnapshot"] = match (latest, snapshot) {
        (Some(path), Some(snapshot)) => json!({
            "path": path.display().to_string(),
            "sessionId": snapshot.session_id,
            "lastActive": snapshot.last_active.to_rfc3339(),
        }),
        _ => Value::Null,
    };
    report
}

/// Manually declares the usage limit reached. A running daemon picks the
/// flag up on its next log scan and starts the reset wait.
pub fn set_limit(storage: &StorageConfig, now: DateTime<Utc>) -> Result<Value, String> {
    let flag = storage.limit_flag_file();
    create_marker(&flag, &limit_flag_message(now, false)).map_err(|err| err.to_string())?;
    write_routing_flag(&storage.routing_file(), true, now).map_err(|err| err.to_string())?;

    let update = StatusUpdate {
        reason: Some("limit set manually".to_string()),
        ..status_update_for(SessionState::ResetPending)
    };
    let status = merge_status(&storage.status_file(), &update, now).map_err(|err| err.to_string())?;
    info!(path = %flag.display(), "Limit flag set manually");
    Ok(status)
}

/// Pretends the limit has reset: status active, routing open, flag gone.
pub fn simulate_reset(storage: &StorageConfig, now: DateTime<Utc>) -> Result<Value, String> {
    let removed = remove_marker(&storage.limit_flag_file()).map_err(|err| err.to_string())?;
    write_routing_flag(&storage.routing_file(), false, now).map_err(|err| err.to_string())?;

    let update = StatusUpdate {
        reason: Some("reset simulated".to_string()),
        ..status_update_for(SessionState::Active)
    };
    let status = merge_status(&storage.status_file(), &update, now).map_err(|err| err.to_string())?;
    info!(flag_removed = removed, "Reset simulated");
    Ok(status)
}

/// Renders the directive for the latest snapshot and writes it.
pub fn resume(storage: &StorageConfig) -> Result<(PathBuf, String), String> {
    let persistence = WorkStatePersistence::new(storage.backups_dir());
    let snapshot = persistence
        .load_last()
        .ok_or_else(|| format!("No saved work state in {}", storage.backups_dir().display()))?;

    let directive = compose_resume_directive(&snapshot);
    let path = storage.resume_directive_file();
    write_resume_directive(&path, &directive).map_err(|err| err.to_string())?;
    info!(path = %path.display(), session_id = %snapshot.session_id, "Resume directive written");
    Ok((path, directive))
}

pub fn reset_warnings(storage: &StorageConfig, config: &MonitorConfig) -> Result<(), String> {
    TokenUsageEstimator::new(config.usage.clone(), storage)
        .reset_warning_markers()
        .map_err(|err| err.to_string())
}

/// Captures and saves the current work state.
pub fn snapshot(
    storage: &StorageConfig,
    source: &dyn WorkStateSource,
    now: DateTime<Utc>,
) -> Result<PathBuf, String> {
    let session_id = match read_heartbeat(&storage.heartbeat_file()) {
        Ok(Some(heartbeat)) if !heartbeat.session_id.is_empty() => heartbeat.session_id,
        _ => generate_session_id(),
    };
    let snapshot = source.capture(&session_id, now);
    let path = WorkStatePersistence::new(storage.backups_dir())
        .save(&snapshot)
        .map_err(|err| err.to_string())?;
    info!(path = %path.display(), session_id = %session_id, "Snapshot saved");
    Ok(path)
}

pub fn git_source(storage: &StorageConfig, config: &MonitorConfig) -> GitWorkStateSource {
    GitWorkStateSource::new(
        storage.project_dir().to_path_buf(),
        storage.current_task_file(),
        config.consensus.probe_timeout(),
    )
}
