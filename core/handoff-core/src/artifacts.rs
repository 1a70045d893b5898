//! Reading and writing the externally visible artifacts.
//!
//! JSON artifacts are replaced atomically (temp file + rename) so observers
//! never read a half-written document. Marker files carry no required content;
//! only their existence matters.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::warn;

use handoff_protocol::{HeartbeatArtifact, RoutingFlag, StatusUpdate};

use crate::error::{HandoffError, Result};

/// Serializes `value` as pretty JSON and atomically replaces `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| HandoffError::json(format!("serializing {}", path.display()), e))?;
    atomic_write(path, &content)
}

pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs_err::create_dir_all(dir)
        .map_err(|e| HandoffError::io(format!("creating {}", dir.display()), e))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|e| HandoffError::io(format!("creating temp file in {}", dir.display()), e))?;

    tmp.write_all(contents.as_bytes())
        .map_err(|e| HandoffError::io(format!("writing temp file for {}", path.display()), e))?;

    tmp.flush()
        .map_err(|e| HandoffError::io(format!("flushing temp file for {}", path.display()), e))?;

    tmp.persist(path).map_err(|e| {
        HandoffError::io(format!("persisting temp file to {}", path.display()), e.error)
    })?;

    Ok(())
}

/// Reads a JSON document. A missing file is `Ok(None)`.
pub fn read_json_value(path: &Path) -> Result<Option<Value>> {
    let content = match fs_err::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(HandoffError::io(format!("reading {}", path.display()), err)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| HandoffError::json(format!("parsing {}", path.display()), e))
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs_err::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(HandoffError::io(format!("removing {}", path.display()), err)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Heartbeat
// ═══════════════════════════════════════════════════════════════════════════════

pub fn read_heartbeat(path: &Path) -> Result<Option<HeartbeatArtifact>> {
    let Some(value) = read_json_value(path)? else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| HandoffError::json(format!("decoding heartbeat {}", path.display()), e))
}

pub fn write_heartbeat(path: &Path, heartbeat: &HeartbeatArtifact) -> Result<()> {
    write_json_atomic(path, heartbeat)
}

pub fn remove_heartbeat(path: &Path) -> Result<bool> {
    remove_if_present(path)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-modify-write of the status artifact. Keys not in `update` survive.
///
/// An unreadable or malformed existing document is replaced rather than
/// blocking the write.
pub fn merge_status(path: &Path, update: &StatusUpdate, now: DateTime<Utc>) -> Result<Value> {
    let existing = match read_json_value(path) {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Replacing unreadable status artifact");
            Value::Null
        }
    };

    let merged = update.merge_into(existing, now);
    write_json_atomic(path, &merged)?;
    Ok(merged)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Routing Flag
// ═══════════════════════════════════════════════════════════════════════════════

pub fn read_routing_flag(path: &Path) -> Result<Option<RoutingFlag>> {
    let Some(value) = read_json_value(path)? else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| HandoffError::json(format!("decoding routing flag {}", path.display()), e))
}

/// Sets `localOnly`. The router's `lastDecision` is carried over untouched.
pub fn write_routing_flag(path: &Path, local_only: bool, now: DateTime<Utc>) -> Result<RoutingFlag> {
    let last_decision = match read_routing_flag(path) {
        Ok(existing) => existing.and_then(|flag| flag.last_decision),
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Dropping unreadable routing flag");
            None
        }
    };

    let flag = RoutingFlag {
        local_only,
        last_decision,
        updated_at: now,
    };
    write_json_atomic(path, &flag)?;
    Ok(flag)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Markers
// ═══════════════════════════════════════════════════════════════════════════════

pub fn marker_exists(path: &Path) -> bool {
    path.is_file()
}

pub fn create_marker(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs_err::create_dir_all(parent)
            .map_err(|e| HandoffError::io(format!("creating {}", parent.display()), e))?;
    }
    fs_err::write(path, contents)
        .map_err(|e| HandoffError::io(format!("writing marker {}", path.display()), e))
}

pub fn remove_marker(path: &Path) -> Result<bool> {
    remove_if_present(path)
}

pub fn limit_flag_message(at: DateTime<Utc>, automatic: bool) -> String {
    if automatic {
        format!("Auto-detected limit reached at: {}", at.to_rfc3339())
    } else {
        format!("Limit reached at: {}", at.to_rfc3339())
    }
}
