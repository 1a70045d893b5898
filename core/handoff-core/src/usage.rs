//! Token usage estimation from the assistant's JSONL transcript.
//!
//! Only the latest main-chain record carrying `message.usage` counts; usage is
//! never summed across records. Threshold warnings are one-shot per session,
//! enforced by marker files under the markers directory.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::artifacts::{create_marker, marker_exists, remove_marker};
use crate::config::UsageConfig;
use crate::consensus::ConsensusResult;
use crate::error::Result;
use crate::storage::StorageConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageSnapshot {
    pub input_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_create_tokens: u64,
    pub total: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    None,
    Warn,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenWarning {
    pub level: WarningLevel,
    pub percentage: f64,
    pub message: String,
    pub should_warn: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub snapshot: Option<TokenUsageSnapshot>,
    pub percentage: f64,
    pub warning: TokenWarning,
}

impl UsageReport {
    pub fn total(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.total).unwrap_or(0)
    }

    fn idle(message: impl Into<String>) -> Self {
        Self {
            snapshot: None,
            percentage: 0.0,
            warning: TokenWarning {
                level: WarningLevel::None,
                percentage: 0.0,
                message: message.into(),
                should_warn: false,
            },
        }
    }
}

/// Extracts the usage of the latest main-chain record.
///
/// Malformed lines, sidechain records, and records without a parseable
/// timestamp are skipped.
pub fn parse_transcript(content: &str) -> Option<TokenUsageSnapshot> {
    let records: Vec<Value> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect();

    let mut latest: Option<(DateTime<Utc>, &Value)> = None;

    for record in &records {
        if record.get("isSidechain").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        let Some(usage) = record.get("message").and_then(|m| m.get("usage")) else {
            continue;
        };
        if !usage.is_object() {
            continue;
        }
        let Some(timestamp) = record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
        else {
            continue;
        };

        if latest.map(|(best, _)| timestamp > best).unwrap_or(true) {
            latest = Some((timestamp, usage));
        }
    }

    latest.map(|(timestamp, usage)| {
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
        let input_tokens = field("input_tokens");
        let cache_read_tokens = field("cache_read_input_tokens");
        let cache_create_tokens = field("cache_creation_input_tokens");
        TokenUsageSnapshot {
            input_tokens,
            cache_read_tokens,
            cache_create_tokens,
            total: input_tokens
                .saturating_add(cache_read_tokens)
                .saturating_add(cache_create_tokens),
            timestamp,
        }
    })
}

pub struct TokenUsageEstimator {
    config: UsageConfig,
    markers_dir: PathBuf,
    transcript_candidates: Vec<PathBuf>,
    projects_dir: PathBuf,
}

impl TokenUsageEstimator {
    pub fn new(config: UsageConfig, storage: &StorageConfig) -> Self {
        Self {
            config,
            markers_dir: storage.markers_dir(),
            transcript_candidates: storage.transcript_candidates(),
            projects_dir: storage.claude_projects_dir(),
        }
    }

    pub fn warn_marker(&self) -> PathBuf {
        self.marker_path(self.config.warn_threshold)
    }

    pub fn critical_marker(&self) -> PathBuf {
        self.marker_path(self.config.critical_threshold)
    }

    fn marker_path(&self, threshold: f64) -> PathBuf {
        let percent = (threshold * 100.0).round() as u32;
        self.markers_dir
            .join(format!("context-warning-{}.flag", percent))
    }

    /// First existing fixed candidate, else the newest session file under
    /// the projects directory.
    pub fn locate_transcript(&self) -> Option<PathBuf> {
        if let Some(path) = self.transcript_candidates.iter().find(|p| p.is_file()) {
            return Some(path.clone());
        }
        newest_jsonl(&self.projects_dir)
    }

    pub fn read_usage(&self) -> Option<TokenUsageSnapshot> {
        let path = self.locate_transcript()?;
        match fs_err::read_to_string(&path) {
            Ok(content) => parse_transcript(&content),
            Err(err) => {
                debug!(error = %err, path = %path.display(), "Transcript unreadable");
                None
            }
        }
    }

    pub fn percentage(&self, total: u64) -> f64 {
        if self.config.practical_limit == 0 {
            return 0.0;
        }
        total as f64 / self.config.practical_limit as f64
    }

    /// Usage for this tick. Not read while the assistant looks inactive.
    pub fn evaluate(&self, consensus: &ConsensusResult, fallback_confidence: f64) -> UsageReport {
        if !consensus.is_active || consensus.confidence < fallback_confidence {
            return UsageReport::idle("assistant not active");
        }

        let Some(snapshot) = self.read_usage() else {
            return UsageReport::idle(format!(
                "0/{} tokens used (0.0%)",
                format_thousands(self.config.practical_limit)
            ));
        };

        let warning = self.warning_for(snapshot.total);
        UsageReport {
            percentage: warning.percentage,
            snapshot: Some(snapshot),
            warning,
        }
    }

    /// Classifies `total`, creating the marker for any threshold that fires.
    pub fn warning_for(&self, total: u64) -> TokenWarning {
        let percentage = self.percentage(total);
        let used = format!(
            "{}/{} tokens used ({:.1}%)",
            format_thousands(total),
            format_thousands(self.config.practical_limit),
            percentage * 100.0
        );

        let critical_marker = self.critical_marker();
        let warn_marker = self.warn_marker();

        if percentage >= self.config.critical_threshold && !marker_exists(&critical_marker) {
            // The lower warning is moot once the higher one has fired.
            self.touch(&critical_marker);
            self.touch(&warn_marker);
            return TokenWarning {
                level: WarningLevel::Critical,
                percentage,
                message: format!(
                    "[{}% WARNING] {}. CRITICAL: Context limit approaching!",
                    percent_label(self.config.critical_threshold),
                    used
                ),
                should_warn: true,
            };
        }

        if percentage >= self.config.warn_threshold && !marker_exists(&warn_marker) {
            self.touch(&warn_marker);
            return TokenWarning {
                level: WarningLevel::Warn,
                percentage,
                message: format!(
                    "[{}% WARNING] {}. Context is getting low.",
                    percent_label(self.config.warn_threshold),
                    used
                ),
                should_warn: true,
            };
        }

        TokenWarning {
            level: WarningLevel::None,
            percentage,
            message: used,
            should_warn: false,
        }
    }

    fn touch(&self, marker: &Path) {
        if let Err(err) = create_marker(marker, "") {
            debug!(error = %err, path = %marker.display(), "Could not create warning marker");
        }
    }

    /// Clears both markers so the next session warns again.
    pub fn reset_warning_markers(&self) -> Result<()> {
        remove_marker(&self.warn_marker())?;
        remove_marker(&self.critical_marker())?;
        Ok(())
    }
}

fn newest_jsonl(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.into_path()))
        })
        .max_by_key(|(modified, _): &(SystemTime, PathBuf)| *modified)
        .map(|(_, path)| path)
}

fn percent_label(threshold: f64) -> u32 {
    (threshold * 100.0).round() as u32
}

/// `160000` -> `160,000`.
pub fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{ActivitySignal, SignalDetail, SignalSource};

    fn estimator(temp: &Path) -> TokenUsageEstimator {
        let storage = StorageConfig::with_roots(temp.join(".handoff"), temp.join(".claude"))
            .with_project_dir(temp.join("project"));
        TokenUsageEstimator::new(UsageConfig::default(), &storage)
    }

    fn active_consensus(confidence_active: usize) -> ConsensusResult {
        let now = Utc::now();
        let outcomes = [
            SignalSource::Process,
            SignalSource::Port,
            SignalSource::Config,
            SignalSource::Heartbeat,
        ]
        .iter()
        .enumerate()
        .map(|(i, source)| crate::signals::ProbeOutcome {
            source: *source,
            signal: Some(ActivitySignal {
                source: *source,
                observed_at: now,
                active: i < confidence_active,
                detail: SignalDetail::Nothing,
            }),
        })
        .collect();
        ConsensusResult::from_outcomes(outcomes, 2, now)
    }

    #[test]
    fn latest_record_wins_and_is_not_summed() {
        let transcript = r#"
{"timestamp":"2026-03-01T10:00:00Z","message":{"usage":{"input_tokens":100,"cache_read_input_tokens":1000,"cache_creation_input_tokens":10}}}
{"timestamp":"2026-03-01T10:05:00Z","message":{"usage":{"input_tokens":5,"cache_read_input_tokens":2000,"cache_creation_input_tokens":20}}}
{"timestamp":"2026-03-01T10:02:00Z","message":{"usage":{"input_tokens":999}}}
"#;
        let snapshot = parse_transcript(transcript).expect("usage");
        assert_eq!(snapshot.total, 2025);
        assert_eq!(snapshot.cache_read_tokens, 2000);
    }

    #[test]
    fn sidechain_and_malformed_lines_are_skipped() {
        let transcript = r#"
not json at all
{"timestamp":"2026-03-01T10:00:00Z","message":{"usage":{"input_tokens":10}}}
{"timestamp":"2026-03-01T11:00:00Z","isSidechain":true,"message":{"usage":{"input_tokens":50000}}}
{"timestamp":"2026-03-01T12:00:00Z","message":{"content":"no usage here"}}
"#;
        let snapshot = parse_transcript(transcript).expect("usage");
        assert_eq!(snapshot.total, 10);
    }

    #[test]
    fn no_usage_yields_none() {
        assert_eq!(parse_transcript(""), None);
        assert_eq!(parse_transcript("{\"message\":{}}\n"), None);
    }

    #[test]
    fn thresholds_fire_once_each_in_ascending_order() {
        let temp = tempfile::tempdir().expect("temp dir");
        let estimator = estimator(temp.path());

        let mut fired = Vec::new();
        for step in 0..=95u64 {
            let total = 160_000 * step / 100;
            let warning = estimator.warning_for(total);
            if warning.should_warn {
                fired.push((step, warning.level));
            }
        }

        assert_eq!(fired, vec![(75, WarningLevel::Warn), (90, WarningLevel::Critical)]);
    }

    #[test]
    fn jump_past_critical_fires_only_critical() {
        let temp = tempfile::tempdir().expect("temp dir");
        let estimator = estimator(temp.path());

        let first = estimator.warning_for(150_000);
        assert_eq!(first.level, WarningLevel::Critical);
        assert_eq!(
            first.message,
            "[90% WARNING] 150,000/160,000 tokens used (93.8%). CRITICAL: Context limit approaching!"
        );

        let second = estimator.warning_for(150_000);
        assert!(!second.should_warn);
        assert_eq!(second.message, "150,000/160,000 tokens used (93.8%)");
    }

    #[test]
    fn reset_markers_rearms_warnings() {
        let temp = tempfile::tempdir().expect("temp dir");
        let estimator = estimator(temp.path());

        assert_eq!(estimator.warning_for(125_000).level, WarningLevel::Warn);
        assert!(estimator.warn_marker().exists());
        assert!(!estimator.warning_for(125_000).should_warn);

        estimator.reset_warning_markers().expect("reset");
        assert!(!estimator.warn_marker().exists());
        let again = estimator.warning_for(125_000);
        assert_eq!(
            again.message,
            "[75% WARNING] 125,000/160,000 tokens used (78.1%). Context is getting low."
        );
    }

    #[test]
    fn evaluate_skips_transcript_when_inactive() {
        let temp = tempfile::tempdir().expect("temp dir");
        let estimator = estimator(temp.path());
        let transcript = temp.path().join("project").join(".claude").join("transcript.jsonl");
        fs_err::create_dir_all(transcript.parent().expect("parent")).expect("mkdir");
        fs_err::write(
            &transcript,
            r#"{"timestamp":"2026-03-01T10:00:00Z","message":{"usage":{"input_tokens":80000}}}"#,
        )
        .expect("write");

        let report = estimator.evaluate(&active_consensus(1), 0.4);
        assert_eq!(report.total(), 0);
        assert_eq!(report.warning.message, "assistant not active");

        let report = estimator.evaluate(&active_consensus(3), 0.4);
        assert_eq!(report.total(), 80_000);
        assert_eq!(report.percentage, 0.5);
    }

    #[test]
    fn falls_back_to_newest_project_session() {
        let temp = tempfile::tempdir().expect("temp dir");
        let estimator = estimator(temp.path());
        let session_dir = temp.path().join(".claude").join("projects").join("-work-app");
        fs_err::create_dir_all(&session_dir).expect("mkdir");
        let session = session_dir.join("abc.jsonl");
        fs_err::write(&session, "").expect("write");

        assert_eq!(estimator.locate_transcript(), Some(session));
    }

    #[test]
    fn thousands_separator() {
        assert_eq!(format_thousands(0), "0");
        assert_eq!(format_thousands(999), "999");
        assert_eq!(format_thousands(1_000), "1,000");
        assert_eq!(format_thousands(160_000), "160,000");
        assert_eq!(format_thousands(1_234_567), "1,234,567");
    }
}
