//! Storage configuration and path management for handoff.
//!
//! Every artifact path is decided here so tests can redirect all I/O with
//! [`StorageConfig::with_roots`].
//!
//! Two namespaces are involved:
//!
//! - `root` (default `~/.handoff`): artifacts we own and write.
//! - `claude_root` (default `~/.claude`): assistant data we only read.

use std::path::{Path, PathBuf};

use handoff_protocol::{
    HEARTBEAT_FILE, LIMIT_FLAG_FILE, RESUME_DIRECTIVE_FILE, ROUTING_FILE, STATUS_FILE,
};

use crate::error::{HandoffError, Result};

pub const ROOT_ENV: &str = "HANDOFF_HOME";
pub const CLAUDE_ROOT_ENV: &str = "HANDOFF_CLAUDE_HOME";

/// Central configuration for all handoff storage paths.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
    claude_root: PathBuf,
    home: PathBuf,
    project_dir: PathBuf,
}

impl StorageConfig {
    /// Resolves paths from the environment, falling back to the home directory.
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir().ok_or(HandoffError::HomeDirNotFound)?;
        let root = std::env::var_os(ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".handoff"));
        let claude_root = std::env::var_os(CLAUDE_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".claude"));
        let project_dir = std::env::current_dir().unwrap_or_else(|_| home.clone());
        Ok(Self {
            root,
            claude_root,
            home,
            project_dir,
        })
    }

    /// Creates a StorageConfig with custom roots. Used for testing.
    /// The home and project directories both default to `root`'s parent.
    pub fn with_roots(root: PathBuf, claude_root: PathBuf) -> Self {
        let base = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.clone());
        Self {
            root,
            claude_root,
            home: base.clone(),
            project_dir: base,
        }
    }

    pub fn with_project_dir(mut self, project_dir: PathBuf) -> Self {
        self.project_dir = project_dir;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn claude_root(&self) -> &Path {
        &self.claude_root
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Owned Artifacts
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn heartbeat_file(&self) -> PathBuf {
        self.root.join(HEARTBEAT_FILE)
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn routing_file(&self) -> PathBuf {
        self.root.join(ROUTING_FILE)
    }

    pub fn limit_flag_file(&self) -> PathBuf {
        self.root.join(LIMIT_FLAG_FILE)
    }

    pub fn resume_directive_file(&self) -> PathBuf {
        self.root.join(RESUME_DIRECTIVE_FILE)
    }

    /// Directory holding the one-shot warning markers.
    pub fn markers_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Directory holding append-only work-state snapshots.
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn backoff_file(&self) -> PathBuf {
        self.root.join("daemon-backoff.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Assistant Paths (Read-Only)
    // ─────────────────────────────────────────────────────────────────────────────

    /// Config files whose presence indicates an installed, configured assistant.
    pub fn assistant_config_files(&self) -> Vec<PathBuf> {
        vec![
            self.claude_root.join("settings.json"),
            self.home.join(".claude.json"),
        ]
    }

    /// Transcript locations in lookup order. The first existing file wins;
    /// `claude_projects_dir` is searched afterwards for the newest session file.
    pub fn transcript_candidates(&self) -> Vec<PathBuf> {
        vec![
            self.project_dir.join(".claude").join("transcript.jsonl"),
            self.project_dir.join(".claude").join("transcript"),
            self.claude_root.join("transcript.jsonl"),
            self.claude_root.join("transcript"),
        ]
    }

    pub fn claude_projects_dir(&self) -> PathBuf {
        self.claude_root.join("projects")
    }

    /// Directories searched recursively for the assistant's free-text log.
    pub fn log_search_dirs(&self) -> Vec<PathBuf> {
        let support = self.home.join("Library").join("Application Support");
        vec![
            support.join("Cursor").join("logs"),
            support.join("Claude").join("logs"),
            self.home.join("Library").join("Logs").join("Claude"),
            self.claude_root.join("logs"),
        ]
    }

    /// Task file maintained by the session tooling inside the project.
    pub fn current_task_file(&self) -> PathBuf {
        self.project_dir
            .join(".claude")
            .join("state")
            .join("current_task.json")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directory Creation
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.markers_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }
}
