//! Work-state snapshots and the resume directive.
//!
//! Snapshots are append-only: every save creates a new file named
//! `work-state-<timestamp>-<session>.json` and no file is ever rewritten.
//! "Latest" is decided by the timestamp encoded in the name, not by mtime.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use handoff_protocol::{NextAction, ProjectState, WorkStateSnapshot, WORK_STATE_PREFIX};

use crate::artifacts::atomic_write;
use crate::command::run_with_timeout;
use crate::error::{HandoffError, Result};

const NAME_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
const MAX_COLLISION_SUFFIX: u32 = 1000;

#[derive(Debug, Clone)]
pub struct WorkStatePersistence {
    dir: PathBuf,
}

impl WorkStatePersistence {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `snapshot` to a new file. Never replaces an existing one.
    pub fn save(&self, snapshot: &WorkStateSnapshot) -> Result<PathBuf> {
        fs_err::create_dir_all(&self.dir)
            .map_err(|e| HandoffError::io(format!("creating {}", self.dir.display()), e))?;

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| HandoffError::json("serializing work-state snapshot", e))?;
        let stamp = snapshot.last_active.format(NAME_TIME_FORMAT).to_string();
        let session = sanitize_session_id(&snapshot.session_id);

        for attempt in 0..MAX_COLLISION_SUFFIX {
            let name = if attempt == 0 {
                format!("{}{}-{}.json", WORK_STATE_PREFIX, stamp, session)
            } else {
                format!("{}{}-{}~{}.json", WORK_STATE_PREFIX, stamp, session, attempt)
            };
            let path = self.dir.join(name);

            let mut file = match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(HandoffError::io(format!("creating {}", path.display()), err))
                }
            };
            file.write_all(content.as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|e| HandoffError::io(format!("writing {}", path.display()), e))?;

            debug!(path = %path.display(), session_id = %snapshot.session_id, "Saved work-state snapshot");
            return Ok(path);
        }

        Err(HandoffError::io(
            format!("allocating snapshot name in {}", self.dir.display()),
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "too many collisions"),
        ))
    }

    /// Snapshot files ordered oldest to newest by encoded timestamp.
    pub fn list(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs_err::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut keyed: Vec<((DateTime<Utc>, u32), PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                parse_snapshot_name(&name).map(|key| (key, entry.path()))
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().map(|(_, path)| path).collect()
    }

    /// Most recent readable snapshot, or `None` when there is nothing to load.
    pub fn load_last(&self) -> Option<WorkStateSnapshot> {
        for path in self.list().into_iter().rev() {
            match read_snapshot(&path) {
                Ok(snapshot) => return Some(snapshot),
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "Skipping unreadable snapshot")
                }
            }
        }
        None
    }
}

fn read_snapshot(path: &Path) -> Result<WorkStateSnapshot> {
    let content = fs_err::read_to_string(path)
        .map_err(|e| HandoffError::io(format!("reading {}", path.display()), e))?;
    serde_json::from_str(&content)
        .map_err(|e| HandoffError::json(format!("parsing {}", path.display()), e))
}

/// Extracts `(timestamp, collision suffix)` from a snapshot file name.
fn parse_snapshot_name(name: &str) -> Option<(DateTime<Utc>, u32)> {
    let rest = name.strip_prefix(WORK_STATE_PREFIX)?.strip_suffix(".json")?;
    let (stamp, tail) = rest.split_once('-')?;
    let time = NaiveDateTime::parse_from_str(stamp, NAME_TIME_FORMAT)
        .ok()?
        .and_utc();
    let suffix = tail
        .rsplit_once('~')
        .and_then(|(_, n)| n.parse::<u32>().ok())
        .unwrap_or(0);
    Some((time, suffix))
}

fn sanitize_session_id(session_id: &str) -> String {
    let cleaned: String = session_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resume Directive
// ═══════════════════════════════════════════════════════════════════════════════

/// Renders the resume message for `snapshot`. Same input, same output.
pub fn compose_resume_directive(snapshot: &WorkStateSnapshot) -> String {
    let project = &snapshot.project_state;
    let mut out = String::new();

    out.push_str("# Session Resume\n\n");

    out.push_str("## Previous Session Summary\n");
    out.push_str(&format!("- **Last Active**: {}\n", snapshot.last_active.to_rfc3339()));
    out.push_str(&format!("- **Session ID**: {}\n", snapshot.session_id));
    out.push_str("- **Status**: Restored after the assistant became available again\n\n");

    out.push_str("## Current Project State\n");
    out.push_str(&format!(
        "- **Branch**: {}\n",
        project.current_branch.as_deref().unwrap_or("N/A")
    ));
    out.push_str(&format!(
        "- **Last Commit**: {}\n",
        project.last_commit.as_deref().unwrap_or("N/A")
    ));
    if project.modified_files.is_empty() {
        out.push_str("- **Modified Files**: none\n\n");
    } else {
        out.push_str("- **Modified Files**:\n");
        for file in &project.modified_files {
            out.push_str(&format!("  - {}\n", file));
        }
        out.push('\n');
    }

    out.push_str("## Next Actions to Continue\n");
    if snapshot.next_actions.is_empty() {
        out.push_str("Continue with previous task\n\n");
    } else {
        for action in &snapshot.next_actions {
            out.push_str(&format!("- {}\n", action.description));
        }
        out.push('\n');
    }

    if !snapshot.pending_operations.is_empty() {
        out.push_str("## Pending Operations\n");
        for operation in &snapshot.pending_operations {
            out.push_str(&format!("- {}\n", render_inline(operation)));
        }
        out.push('\n');
    }

    out.push_str("## Context\n");
    if snapshot.current_task.is_null() {
        out.push_str("Previous conversation context\n");
    } else {
        let pretty = serde_json::to_string_pretty(&snapshot.current_task)
            .unwrap_or_else(|_| snapshot.current_task.to_string());
        out.push_str("```json\n");
        out.push_str(&pretty);
        out.push_str("\n```\n");
    }

    out.push_str("\n---\n*Restored automatically after the previous session became unavailable.*\n");
    out
}

fn render_inline(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

pub fn write_resume_directive(path: &Path, directive: &str) -> Result<()> {
    atomic_write(path, directive)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Capture
// ═══════════════════════════════════════════════════════════════════════════════

/// Gathers the recoverable context for a snapshot.
pub trait WorkStateSource: Send + Sync {
    fn capture(&self, session_id: &str, now: DateTime<Utc>) -> WorkStateSnapshot;
}

/// Reads git state and the session tooling's task file from the project.
pub struct GitWorkStateSource {
    project_dir: PathBuf,
    current_task_file: PathBuf,
    timeout: Duration,
}

impl GitWorkStateSource {
    pub fn new(project_dir: PathBuf, current_task_file: PathBuf, timeout: Duration) -> Self {
        Self {
            project_dir,
            current_task_file,
            timeout,
        }
    }

    fn git(&self, args: &[&str]) -> Option<String> {
        match run_with_timeout("git", args, Some(&self.project_dir), self.timeout) {
            Ok(output) if output.success => Some(output.stdout),
            Ok(output) => {
                debug!(args = ?args, stderr = %output.stderr.trim(), "git exited non-zero");
                None
            }
            Err(err) => {
                debug!(args = ?args, error = %err, "git unavailable");
                None
            }
        }
    }

    fn project_state(&self) -> ProjectState {
        let current_branch = self
            .git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|out| out.trim().to_string())
            .filter(|branch| !branch.is_empty());
        let last_commit = self
            .git(&["log", "-1", "--format=%h %s"])
            .map(|out| out.trim().to_string())
            .filter(|commit| !commit.is_empty());
        let modified_files = self
            .git(&["status", "--porcelain"])
            .map(|out| parse_porcelain(&out))
            .unwrap_or_default();

        ProjectState {
            modified_files,
            last_commit,
            current_branch,
        }
    }

    fn current_task(&self) -> Value {
        let Ok(content) = fs_err::read_to_string(&self.current_task_file) else {
            return Value::Null;
        };
        serde_json::from_str(&content).unwrap_or_else(|err| {
            debug!(error = %err, "current task file is not JSON");
            Value::Null
        })
    }
}

impl WorkStateSource for GitWorkStateSource {
    fn capture(&self, session_id: &str, now: DateTime<Utc>) -> WorkStateSnapshot {
        let current_task = self.current_task();
        let next_actions = extract_array(&current_task, &["nextActions", "next_actions"])
            .iter()
            .map(|item| NextAction {
                description: render_inline(item),
            })
            .collect();
        let pending_operations =
            extract_array(&current_task, &["pendingOperations", "pending_operations"]);

        WorkStateSnapshot {
            session_id: session_id.to_string(),
            last_active: now,
            current_task,
            pending_operations,
            project_state: self.project_state(),
            next_actions,
        }
    }
}

fn extract_array(task: &Value, keys: &[&str]) -> Vec<Value> {
    keys.iter()
        .find_map(|key| task.get(*key).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default()
}

/// Paths from `git status --porcelain` (v1). Renames report the new path.
fn parse_porcelain(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let path = &line[3..];
            match path.split_once(" -> ") {
                Some((_, to)) => to.to_string(),
                None => path.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("parse")
            .with_timezone(&Utc)
    }

    fn snapshot(session: &str, when: &str) -> WorkStateSnapshot {
        WorkStateSnapshot {
            session_id: session.to_string(),
            last_active: at(when),
            current_task: Value::Null,
            pending_operations: Vec::new(),
            project_state: ProjectState::default(),
            next_actions: Vec::new(),
        }
    }

    #[test]
    fn load_last_is_none_for_missing_or_empty_dir() {
        let temp = tempfile::tempdir().expect("temp dir");
        let persistence = WorkStatePersistence::new(temp.path().join("backups"));
        assert!(persistence.load_last().is_none());

        fs_err::create_dir_all(temp.path().join("backups")).expect("mkdir");
        fs_err::write(temp.path().join("backups").join("notes.txt"), "x").expect("write");
        assert!(persistence.load_last().is_none());
    }

    #[test]
    fn load_last_uses_encoded_timestamp_not_write_order() {
        let temp = tempfile::tempdir().expect("temp dir");
        let persistence = WorkStatePersistence::new(temp.path().to_path_buf());

        persistence.save(&snapshot("s-late", "2026-03-01T12:00:00Z")).expect("save");
        persistence.save(&snapshot("s-early", "2026-03-01T09:00:00Z")).expect("save");
        persistence.save(&snapshot("s-mid", "2026-03-01T10:30:00Z")).expect("save");

        assert_eq!(persistence.list().len(), 3);
        assert_eq!(persistence.load_last().expect("snapshot").session_id, "s-late");
    }

    #[test]
    fn save_never_overwrites_on_name_collision() {
        let temp = tempfile::tempdir().expect("temp dir");
        let persistence = WorkStatePersistence::new(temp.path().to_path_buf());

        let mut first = snapshot("same", "2026-03-01T10:00:00Z");
        first.current_task = json!({"n": 1});
        let mut second = first.clone();
        second.current_task = json!({"n": 2});

        let a = persistence.save(&first).expect("save");
        let b = persistence.save(&second).expect("save");
        assert_ne!(a, b);
        assert!(b.to_string_lossy().ends_with("~1.json"));

        assert_eq!(persistence.load_last().expect("snapshot").current_task, json!({"n": 2}));
        assert_eq!(read_snapshot(&a).expect("first").current_task, json!({"n": 1}));
    }

    #[test]
    fn load_last_skips_corrupt_newest() {
        let temp = tempfile::tempdir().expect("temp dir");
        let persistence = WorkStatePersistence::new(temp.path().to_path_buf());
        persistence.save(&snapshot("good", "2026-03-01T10:00:00Z")).expect("save");
        fs_err::write(
            temp.path().join("work-state-20260302T000000.000Z-bad.json"),
            "{broken",
        )
        .expect("write");

        assert_eq!(persistence.load_last().expect("snapshot").session_id, "good");
    }

    #[test]
    fn snapshot_name_sanitizes_session_id() {
        let temp = tempfile::tempdir().expect("temp dir");
        let persistence = WorkStatePersistence::new(temp.path().to_path_buf());
        let path = persistence
            .save(&snapshot("../evil/id", "2026-03-01T10:00:00Z"))
            .expect("save");
        assert_eq!(path.parent(), Some(temp.path()));
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("work-state-20260301T100000.000Z-___evil_id.json")
        );
    }

    #[test]
    fn resume_directive_is_deterministic_and_complete() {
        let mut state = snapshot("session-42", "2026-03-01T10:00:00Z");
        state.project_state = ProjectState {
            modified_files: vec!["src/lib.rs".to_string()],
            last_commit: Some("abc123 Add parser".to_string()),
            current_branch: Some("main".to_string()),
        };
        state.next_actions = vec![NextAction {
            description: "Finish the tokenizer".to_string(),
        }];
        state.pending_operations = vec![json!("run tests"), json!({"description": "push branch"})];
        state.current_task = json!({"task": "parser"});

        let directive = compose_resume_directive(&state);
        assert_eq!(directive, compose_resume_directive(&state));
        assert!(directive.contains("- **Session ID**: session-42"));
        assert!(directive.contains("- **Branch**: main"));
        assert!(directive.contains("- **Last Commit**: abc123 Add parser"));
        assert!(directive.contains("  - src/lib.rs"));
        assert!(directive.contains("- Finish the tokenizer"));
        assert!(directive.contains("- run tests"));
        assert!(directive.contains("- push branch"));
        assert!(directive.contains("\"task\": \"parser\""));
    }

    #[test]
    fn resume_directive_defaults_for_sparse_snapshot() {
        let directive = compose_resume_directive(&snapshot("s", "2026-03-01T10:00:00Z"));
        assert!(directive.contains("Continue with previous task"));
        assert!(directive.contains("Previous conversation context"));
        assert!(directive.contains("- **Branch**: N/A"));
        assert!(!directive.contains("## Pending Operations"));
    }

    #[test]
    fn capture_reads_task_file_outside_git() {
        let temp = tempfile::tempdir().expect("temp dir");
        let task_file = temp.path().join(".claude").join("state").join("current_task.json");
        fs_err::create_dir_all(task_file.parent().expect("parent")).expect("mkdir");
        fs_err::write(
            &task_file,
            r#"{"task":"refactor","nextActions":["write docs"],"pendingOperations":[{"description":"deploy"}]}"#,
        )
        .expect("write");

        let source = GitWorkStateSource::new(
            temp.path().to_path_buf(),
            task_file,
            Duration::from_secs(5),
        );
        let captured = source.capture("session-1", at("2026-03-01T10:00:00Z"));
        assert_eq!(captured.session_id, "session-1");
        assert_eq!(captured.current_task["task"], json!("refactor"));
        assert_eq!(captured.next_actions[0].description, "write docs");
        assert_eq!(captured.pending_operations.len(), 1);
    }

    #[test]
    fn porcelain_paths_follow_renames() {
        let parsed = parse_porcelain(" M src/main.rs\n?? new.txt\nR  old.rs -> new.rs\n");
        assert_eq!(parsed, vec!["src/main.rs", "new.txt", "new.rs"]);
    }
}
