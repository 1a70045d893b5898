//! Debounced rate-limit detection from the assistant's free-text log.
//!
//! The log is tailed by byte offset. A scan tick whose delta contains a limit
//! phrase records one hit in a [`DetectionWindow`]; enough hits inside the
//! window confirm a limit event. Once confirmed, detection is latched off and
//! the detector waits for a [`ResetProbe`] to stop reporting limit wording.
//! A limit flag written by an operator confirms a limit on the next tick too.
//!
//! Without a log file the detector runs degraded: it polls for the limit flag
//! artifact and notes whether the assistant process is still around.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifacts::{create_marker, limit_flag_message, marker_exists, remove_marker};
use crate::clock::to_chrono;
use crate::command::run_with_timeout;
use crate::config::LogDetectorConfig;
use crate::patterns::contains_limit_phrase;
use crate::process::{find_target, ProcessInspector};

const LOG_SEARCH_DEPTH: usize = 4;

// ═══════════════════════════════════════════════════════════════════════════════
// Detection Window
// ═══════════════════════════════════════════════════════════════════════════════

/// Rolling list of hit timestamps no older than `window`.
#[derive(Debug, Clone)]
pub struct DetectionWindow {
    window: chrono::Duration,
    threshold: usize,
    hits: VecDeque<DateTime<Utc>>,
}

impl DetectionWindow {
    pub fn new(window: Duration, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            window: to_chrono(window),
            threshold,
            hits: VecDeque::with_capacity(threshold),
        }
    }

    /// Records a hit at `now`. Returns true once the threshold is reached.
    pub fn record(&mut self, now: DateTime<Utc>) -> bool {
        self.prune(now);
        if self.hits.len() == self.threshold {
            self.hits.pop_front();
        }
        self.hits.push_back(now);
        self.hits.len() >= self.threshold
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(oldest) = self.hits.front() {
            if now.signed_duration_since(*oldest) > self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reset Probe
// ═══════════════════════════════════════════════════════════════════════════════

/// Lightweight call whose output reveals whether the limit still applies.
/// `Err` carries the failure text, which is scanned like normal output.
pub trait ResetProbe: Send + Sync {
    fn check(&self) -> std::result::Result<String, String>;
}

#[derive(Debug, Clone)]
pub struct CommandResetProbe {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandResetProbe {
    pub fn from_config(config: &LogDetectorConfig) -> Option<Self> {
        let (program, args) = config.reset_probe_command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(config.reset_probe_timeout_secs),
        })
    }
}

impl ResetProbe for CommandResetProbe {
    fn check(&self) -> std::result::Result<String, String> {
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        match run_with_timeout(&self.program, &args, None, self.timeout) {
            Ok(output) if output.success => Ok(output.combined()),
            Ok(output) => Err(format!("Command failed: {}", output.combined())),
            Err(err) => Err(err.to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Detector
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOrigin {
    /// Debounced phrase matches in the log.
    Log,
    /// Limit flag found while running without a log.
    FlagFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitEvent {
    pub at: DateTime<Utc>,
    pub origin: LimitOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetCheck {
    NotWaiting,
    /// Probe output still carries limit wording, or the probe failed.
    StillLimited,
    Reset,
}

pub struct LogLimitDetector {
    log_path: Option<PathBuf>,
    cursor: u64,
    window: DetectionWindow,
    waiting_for_reset: bool,
    flag_path: PathBuf,
    inspector: Arc<dyn ProcessInspector>,
    process_markers: Vec<String>,
    last_process_present: Option<bool>,
}

impl LogLimitDetector {
    /// Starts tailing `log_path` from its current end, or runs degraded when
    /// there is no log.
    pub fn new(
        config: &LogDetectorConfig,
        log_path: Option<PathBuf>,
        flag_path: PathBuf,
        inspector: Arc<dyn ProcessInspector>,
        process_markers: Vec<String>,
    ) -> Self {
        let cursor = log_path
            .as_deref()
            .and_then(|path| fs_err::metadata(path).ok())
            .map(|meta| meta.len())
            .unwrap_or(0);

        match &log_path {
            Some(path) => info!(path = %path.display(), cursor, "Tailing assistant log"),
            None => warn!("No assistant log found; limit detection degraded to flag polling"),
        }

        Self {
            log_path,
            cursor,
            window: DetectionWindow::new(
                Duration::from_secs(config.window_secs),
                config.threshold,
            ),
            waiting_for_reset: false,
            flag_path,
            inspector,
            process_markers,
            last_process_present: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.log_path.is_none()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn is_waiting_for_reset(&self) -> bool {
        self.waiting_for_reset
    }

    pub fn pending_hits(&self) -> usize {
        self.window.len()
    }

    /// Resumes waiting after a restart that found the limit flag in place.
    pub fn resume_waiting(&mut self) {
        self.window.clear();
        self.waiting_for_reset = true;
    }

    /// One scan tick. Returns an event when a limit is confirmed, either from
    /// the log or from a limit flag written by someone else.
    pub fn scan(&mut self, now: DateTime<Utc>) -> Option<LimitEvent> {
        if self.waiting_for_reset {
            return None;
        }
        match self.log_path.clone() {
            Some(path) if marker_exists(&self.flag_path) => {
                // Keep the cursor current so the wait starts from a clean log.
                if let Err(err) = self.read_delta(&path) {
                    debug!(error = %err, path = %path.display(), "Log delta unreadable");
                }
                Some(self.confirm(now, LimitOrigin::FlagFile))
            }
            Some(path) => self.scan_log(&path, now),
            None => self.poll_degraded(now),
        }
    }

    fn scan_log(&mut self, path: &Path, now: DateTime<Utc>) -> Option<LimitEvent> {
        self.window.prune(now);

        let delta = match self.read_delta(path) {
            Ok(delta) => delta,
            Err(err) => {
                debug!(error = %err, path = %path.display(), "Log delta unreadable");
                return None;
            }
        };
        if delta.is_empty() || !contains_limit_phrase(&delta) {
            return None;
        }

        let hits_before = self.window.len();
        if !self.window.record(now) {
            debug!(hits = hits_before + 1, "Limit phrase seen; awaiting confirmation");
            return None;
        }

        Some(self.confirm(now, LimitOrigin::Log))
    }

    /// Reads bytes appended since the cursor and advances it. A file shorter
    /// than the cursor was truncated or rotated and is re-read from the start.
    fn read_delta(&mut self, path: &Path) -> std::io::Result<String> {
        let mut file = fs_err::File::open(path)?;
        let len = file.metadata()?.len();
        if len < self.cursor {
            debug!(len, cursor = self.cursor, "Log shrank; rewinding cursor");
            self.cursor = 0;
        }
        if len == self.cursor {
            return Ok(String::new());
        }

        file.seek(SeekFrom::Start(self.cursor))?;
        let mut buffer = Vec::with_capacity((len - self.cursor) as usize);
        file.take(len - self.cursor).read_to_end(&mut buffer)?;
        self.cursor = len;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn poll_degraded(&mut self, now: DateTime<Utc>) -> Option<LimitEvent> {
        let present = match self.inspector.list() {
            Ok(records) => Some(find_target(&records, &self.process_markers).is_some()),
            Err(err) => {
                debug!(error = %err, "Process listing failed in degraded mode");
                None
            }
        };
        if present.is_some() && present != self.last_process_present {
            info!(present = ?present, "Assistant process presence changed");
            self.last_process_present = present;
        }

        if marker_exists(&self.flag_path) {
            return Some(self.confirm(now, LimitOrigin::FlagFile));
        }
        None
    }

    fn confirm(&mut self, now: DateTime<Utc>, origin: LimitOrigin) -> LimitEvent {
        self.window.clear();
        self.waiting_for_reset = true;

        if origin == LimitOrigin::Log {
            if let Err(err) = create_marker(&self.flag_path, &limit_flag_message(now, true)) {
                warn!(error = %err, path = %self.flag_path.display(), "Failed to write limit flag");
            }
        }

        info!(origin = ?origin, "Usage limit confirmed; waiting for reset");
        LimitEvent { at: now, origin }
    }

    /// One reset-wait probe. Output without limit wording means the limit has
    /// reset. A failed call proves nothing either way and keeps the wait. On
    /// reset the flag is removed, the waiting latch cleared, and the cursor
    /// moved past anything logged while waiting.
    pub fn check_reset(&mut self, probe: &dyn ResetProbe) -> ResetCheck {
        if !self.waiting_for_reset {
            return ResetCheck::NotWaiting;
        }

        let output = match probe.check() {
            Ok(output) => output,
            Err(err) => {
                if contains_limit_phrase(&err) {
                    info!("Assistant still limited");
                } else {
                    warn!(error = %err, "Reset check failed; still waiting");
                }
                return ResetCheck::StillLimited;
            }
        };
        if contains_limit_phrase(&output) {
            info!("Assistant still limited");
            return ResetCheck::StillLimited;
        }

        self.waiting_for_reset = false;
        self.window.clear();
        if let Some(path) = &self.log_path {
            if let Ok(meta) = fs_err::metadata(path) {
                self.cursor = meta.len();
            }
        }
        if let Err(err) = remove_marker(&self.flag_path) {
            warn!(error = %err, path = %self.flag_path.display(), "Failed to remove limit flag");
        }

        info!("Assistant usage limit has reset");
        ResetCheck::Reset
    }
}

/// Newest file under `dirs` whose name looks like the assistant's log.
pub fn discover_log(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .filter(|dir| dir.is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .max_depth(LOG_SEARCH_DEPTH)
                .into_iter()
                .filter_map(|e| e.ok())
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_assistant_log_name(&entry.file_name().to_string_lossy()))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.into_path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, path)| path)
}

fn is_assistant_log_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with("claude.log") || lower.ends_with("claude code.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::FakeInspector;
    use crate::process::ProcessRecord;
    use std::io::Write;
    use std::sync::Mutex;

    struct ScriptedProbe(Mutex<Vec<std::result::Result<String, String>>>);

    impl ResetProbe for ScriptedProbe {
        fn check(&self) -> std::result::Result<String, String> {
            self.0
                .lock()
                .ok()
                .and_then(|mut queue| (!queue.is_empty()).then(|| queue.remove(0)))
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("parse")
            .with_timezone(&Utc)
            + chrono::Duration::seconds(secs)
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        writeln!(file, "{}", text).expect("append");
    }

    fn detector(temp: &Path, log: Option<PathBuf>) -> LogLimitDetector {
        LogLimitDetector::new(
            &LogDetectorConfig::default(),
            log,
            temp.join("limit_reached.flag"),
            Arc::new(FakeInspector::new(Some(Vec::new()))),
            vec!["claude".to_string()],
        )
    }

    #[test]
    fn window_confirms_three_hits_within_fifteen_seconds() {
        let mut window = DetectionWindow::new(Duration::from_secs(15), 3);
        assert!(!window.record(t(0)));
        assert!(!window.record(t(4)));
        assert!(window.record(t(9)));
    }

    #[test]
    fn window_never_confirms_spread_out_hits() {
        let mut window = DetectionWindow::new(Duration::from_secs(15), 3);
        assert!(!window.record(t(0)));
        assert!(!window.record(t(20)));
        assert!(!window.record(t(40)));
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn window_stays_bounded() {
        let mut window = DetectionWindow::new(Duration::from_secs(60), 3);
        for i in 0..10 {
            window.record(t(i));
        }
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn cursor_starts_at_end_of_existing_log() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("claude.log");
        append(&log, "5-hour limit reached");
        append(&log, "5-hour limit reached");
        append(&log, "5-hour limit reached");

        let mut detector = detector(temp.path(), Some(log.clone()));
        assert!(detector.cursor() > 0);
        assert_eq!(detector.scan(t(0)), None);
        assert_eq!(detector.pending_hits(), 0);
    }

    #[test]
    fn confirms_after_three_matching_ticks_and_writes_flag() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("claude.log");
        append(&log, "starting up");
        let mut detector = detector(temp.path(), Some(log.clone()));

        append(&log, "Claude usage limit reached. 5-hour limit reached");
        assert_eq!(detector.scan(t(0)), None);
        append(&log, "unrelated chatter");
        assert_eq!(detector.scan(t(2)), None);
        append(&log, "You've reached your usage limit");
        assert_eq!(detector.scan(t(4)), None);
        append(&log, "try again in 5 hours");
        let event = detector.scan(t(9)).expect("confirmed");

        assert_eq!(event.origin, LimitOrigin::Log);
        assert!(detector.is_waiting_for_reset());
        assert_eq!(detector.pending_hits(), 0);
        let flag = fs_err::read_to_string(temp.path().join("limit_reached.flag")).expect("flag");
        assert!(flag.starts_with("Auto-detected limit reached at: "));

        append(&log, "5-hour limit reached");
        assert_eq!(detector.scan(t(10)), None, "latched while waiting");
    }

    #[test]
    fn external_flag_confirms_while_log_is_watched() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("claude.log");
        append(&log, "starting up");
        let mut detector = detector(temp.path(), Some(log.clone()));
        assert!(!detector.is_degraded());
        assert_eq!(detector.scan(t(0)), None);

        let flag = temp.path().join("limit_reached.flag");
        create_marker(&flag, "Limit reached at: manual").expect("flag");
        append(&log, "5-hour limit reached");
        let event = detector.scan(t(5)).expect("confirmed");

        assert_eq!(event.origin, LimitOrigin::FlagFile);
        assert!(detector.is_waiting_for_reset());
        assert_eq!(detector.pending_hits(), 0);
        assert_eq!(detector.cursor(), fs_err::metadata(&log).expect("meta").len());
        assert_eq!(
            fs_err::read_to_string(&flag).expect("flag"),
            "Limit reached at: manual"
        );
    }

    #[test]
    fn truncated_log_is_reread_from_start() {
        let temp = tempfile::tempdir().expect("temp dir");
        let log = temp.path().join("claude.log");
        append(&log, "a long line that makes the file bigger than the next write");
        let mut detector = detector(temp.path(), Some(log.clone()));

        fs_err::write(&log, "cooldown\n").expect("truncate");
        assert_eq!(detector.scan(t(0)), None);
        assert_eq!(detector.pending_hits(), 1);
        assert_eq!(detector.cursor(), "cooldown\n".len() as u64);
    }

    #[test]
    fn reset_waits_while_output_mentions_limit_or_check_fails() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut detector = detector(temp.path(), None);
        let probe = ScriptedProbe(Mutex::new(vec![
            Ok("Claude AI usage: 5-hour limit reached|1700000000".to_string()),
            Err("Command failed: rate limit reached".to_string()),
            Err("Command timed out after 30s: claude --help".to_string()),
            Err("Failed to spawn claude: No such file or directory".to_string()),
            Ok("Usage: claude [options]".to_string()),
        ]));

        assert_eq!(detector.check_reset(&probe), ResetCheck::NotWaiting);

        create_marker(&temp.path().join("limit_reached.flag"), "x").expect("flag");
        detector.resume_waiting();

        for _ in 0..4 {
            assert_eq!(detector.check_reset(&probe), ResetCheck::StillLimited);
            assert!(detector.is_waiting_for_reset());
            assert!(temp.path().join("limit_reached.flag").exists());
        }

        assert_eq!(detector.check_reset(&probe), ResetCheck::Reset);
        assert!(!detector.is_waiting_for_reset());
        assert!(!temp.path().join("limit_reached.flag").exists());
    }

    #[test]
    fn degraded_mode_confirms_on_flag_file() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut detector = LogLimitDetector::new(
            &LogDetectorConfig::default(),
            None,
            temp.path().join("limit_reached.flag"),
            Arc::new(FakeInspector::new(Some(vec![ProcessRecord {
                pid: 5,
                start_time: None,
                memory_bytes: 0,
                command: "claude".to_string(),
            }]))),
            vec!["claude".to_string()],
        );
        assert!(detector.is_degraded());
        assert_eq!(detector.scan(t(0)), None);

        create_marker(&temp.path().join("limit_reached.flag"), "Limit reached at: x").expect("flag");
        let event = detector.scan(t(10)).expect("confirmed");
        assert_eq!(event.origin, LimitOrigin::FlagFile);
        let flag = fs_err::read_to_string(temp.path().join("limit_reached.flag")).expect("flag");
        assert_eq!(flag, "Limit reached at: x");
    }

    #[test]
    fn discover_log_picks_matching_names() {
        let temp = tempfile::tempdir().expect("temp dir");
        let logs = temp.path().join("logs").join("window1");
        fs_err::create_dir_all(&logs).expect("mkdir");
        fs_err::write(logs.join("renderer.log"), "").expect("write");
        fs_err::write(logs.join("Claude Code.log"), "").expect("write");

        let found = discover_log(&[temp.path().join("logs"), temp.path().join("missing")]);
        assert_eq!(found, Some(logs.join("Claude Code.log")));
    }
}
