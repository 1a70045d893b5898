//! Process-table inspection for the process probe.
//!
//! Inspectors return typed [`ProcessRecord`]s; matching against the
//! assistant's markers happens in [`find_target`] so every backend shares it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use sysinfo::{ProcessRefreshKind, System, UpdateKind};

use crate::command::run_with_timeout;
use crate::config::InspectorKind;
use crate::error::{HandoffError, Result};
use crate::patterns::RE_WHITESPACE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    /// `None` when the platform reported a start time we could not parse.
    pub start_time: Option<DateTime<Utc>>,
    pub memory_bytes: u64,
    pub command: String,
}

pub trait ProcessInspector: Send + Sync {
    fn list(&self) -> Result<Vec<ProcessRecord>>;
}

pub fn inspector_for(kind: InspectorKind, timeout: Duration) -> Arc<dyn ProcessInspector> {
    match kind {
        InspectorKind::Sysinfo => Arc::new(SysinfoInspector),
        InspectorKind::Ps => Arc::new(PsInspector::new(timeout)),
    }
}

/// Picks the assistant process among `records`.
///
/// When several entries match, the highest pid wins: the newest spawn is
/// usually the interactive parent.
pub fn find_target(records: &[ProcessRecord], markers: &[String]) -> Option<ProcessRecord> {
    let own_pid = std::process::id();
    let markers: Vec<String> = markers.iter().map(|m| m.to_lowercase()).collect();

    records
        .iter()
        .filter(|record| record.pid != own_pid)
        .filter(|record| {
            let command = record.command.to_lowercase();
            markers.iter().any(|marker| command.contains(marker))
        })
        .max_by_key(|record| record.pid)
        .cloned()
}

// ═══════════════════════════════════════════════════════════════════════════════
// sysinfo
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default)]
pub struct SysinfoInspector;

impl ProcessInspector for SysinfoInspector {
    fn list(&self) -> Result<Vec<ProcessRecord>> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessRefreshKind::new()
                .with_cmd(UpdateKind::Always)
                .with_memory(),
        );

        let records = sys
            .processes()
            .iter()
            .map(|(pid, process)| {
                let mut command = process.name().to_string();
                if !process.cmd().is_empty() {
                    command.push(' ');
                    command.push_str(&process.cmd().join(" "));
                }
                let start_time = match process.start_time() {
                    0 => None,
                    secs => DateTime::from_timestamp(secs as i64, 0),
                };
                ProcessRecord {
                    pid: pid.as_u32(),
                    start_time,
                    memory_bytes: process.memory(),
                    command,
                }
            })
            .collect();

        Ok(records)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ps
// ═══════════════════════════════════════════════════════════════════════════════

/// Reads `ps aux`. Column layout: USER PID %CPU %MEM VSZ RSS TT STAT STARTED TIME COMMAND.
#[derive(Debug, Clone)]
pub struct PsInspector {
    timeout: Duration,
}

impl PsInspector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ProcessInspector for PsInspector {
    fn list(&self) -> Result<Vec<ProcessRecord>> {
        let output = run_with_timeout("ps", &["aux"], None, self.timeout)?;
        if !output.success {
            return Err(HandoffError::CommandFailed {
                command: "ps aux".to_string(),
                details: output.stderr.trim().to_string(),
            });
        }

        let today = Local::now().date_naive();
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| parse_ps_line(line, today))
            .collect())
    }
}

fn parse_ps_line(line: &str, today: NaiveDate) -> Option<ProcessRecord> {
    let parts: Vec<&str> = RE_WHITESPACE.split(line.trim()).collect();
    if parts.len() < 11 {
        return None;
    }

    let pid = parts[1].parse::<u32>().ok()?;
    let rss_kib = parts[5].parse::<u64>().ok()?;
    let start_time = parse_start_time(parts[8], today).and_then(local_to_utc);

    Some(ProcessRecord {
        pid,
        start_time,
        memory_bytes: rss_kib.saturating_mul(1024),
        command: parts[10..].join(" "),
    })
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

// ─────────────────────────────────────────────────────────────────────────────
// Start-time formats
// ─────────────────────────────────────────────────────────────────────────────

struct StartTimeFormat {
    signature: &'static str,
    pattern: Regex,
    build: fn(&Captures, NaiveDate) -> Option<NaiveDateTime>,
}

static START_TIME_FORMATS: Lazy<Vec<StartTimeFormat>> = Lazy::new(|| {
    vec![
        StartTimeFormat {
            signature: "H:MMam/pm",
            pattern: Regex::new(r"^(\d{1,2}):(\d{2})\s*([AaPp][Mm])$").unwrap(),
            build: build_clock_today,
        },
        StartTimeFormat {
            signature: "Mon DD HH:MM",
            pattern: Regex::new(r"^([A-Za-z]{3})\s*(\d{1,2})\s+(\d{1,2}):(\d{2})$").unwrap(),
            build: build_month_day_time,
        },
        StartTimeFormat {
            signature: "Mon DD",
            pattern: Regex::new(r"^([A-Za-z]{3})\s*(\d{1,2})$").unwrap(),
            build: build_month_day,
        },
    ]
});

/// Parses a `ps` STARTED column relative to `today`.
pub fn parse_start_time(text: &str, today: NaiveDate) -> Option<NaiveDateTime> {
    let text = text.trim();
    START_TIME_FORMATS.iter().find_map(|format| {
        let captures = format.pattern.captures(text)?;
        let parsed = (format.build)(&captures, today);
        if parsed.is_none() {
            tracing::debug!(signature = format.signature, text, "start time out of range");
        }
        parsed
    })
}

fn build_clock_today(caps: &Captures, today: NaiveDate) -> Option<NaiveDateTime> {
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let pm = caps[3].eq_ignore_ascii_case("pm");
    let hour24 = match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    today.and_hms_opt(hour24, minute, 0)
}

fn build_month_day_time(caps: &Captures, today: NaiveDate) -> Option<NaiveDateTime> {
    let date = month_day_this_year(&caps[1], &caps[2], today)?;
    let hour: u32 = caps[3].parse().ok()?;
    let minute: u32 = caps[4].parse().ok()?;
    date.and_hms_opt(hour, minute, 0)
}

fn build_month_day(caps: &Captures, today: NaiveDate) -> Option<NaiveDateTime> {
    month_day_this_year(&caps[1], &caps[2], today)?.and_hms_opt(0, 0, 0)
}

fn month_day_this_year(month: &str, day: &str, today: NaiveDate) -> Option<NaiveDate> {
    use chrono::Datelike;

    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let month = month.to_lowercase();
    let index = MONTHS.iter().position(|m| *m == month)? as u32 + 1;
    let day: u32 = day.parse().ok()?;
    NaiveDate::from_ymd_opt(today.year(), index, day)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Returns a fixed process list, or an error when `records` is `None`.
    pub struct FakeInspector {
        pub records: Mutex<Option<Vec<ProcessRecord>>>,
    }

    impl FakeInspector {
        pub fn new(records: Option<Vec<ProcessRecord>>) -> Self {
            Self {
                records: Mutex::new(records),
            }
        }
    }

    impl ProcessInspector for FakeInspector {
        fn list(&self) -> Result<Vec<ProcessRecord>> {
            self.records
                .lock()
                .ok()
                .and_then(|records| records.clone())
                .ok_or_else(|| HandoffError::CommandFailed {
                    command: "fake".to_string(),
                    details: "unavailable".to_string(),
                })
        }
    }

    fn record(pid: u32, command: &str) -> ProcessRecord {
        ProcessRecord {
            pid,
            start_time: DateTime::from_timestamp(1_700_000_000, 0),
            memory_bytes: 1024,
            command: command.to_string(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn find_target_prefers_highest_matching_pid() {
        let records = vec![
            record(100, "node /usr/lib/@anthropic-ai/claude-code/cli.js"),
            record(300, "/usr/bin/vim notes.txt"),
            record(200, "claude --resume"),
        ];
        let markers = vec!["claude".to_string()];

        let target = find_target(&records, &markers).expect("target");
        assert_eq!(target.pid, 200);
    }

    #[test]
    fn find_target_matches_case_insensitively() {
        let records = vec![record(10, "/Applications/Claude.app/Contents/MacOS/Claude")];
        let markers = vec!["claude".to_string()];
        assert!(find_target(&records, &markers).is_some());
    }

    #[test]
    fn find_target_none_without_matches() {
        let records = vec![record(10, "bash")];
        assert!(find_target(&records, &["claude".to_string()]).is_none());
    }

    #[test]
    fn start_time_table_handles_known_signatures() {
        assert_eq!(
            parse_start_time("3:58PM", today()),
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap().and_hms_opt(15, 58, 0)
        );
        assert_eq!(
            parse_start_time("12:05am", today()),
            NaiveDate::from_ymd_opt(2026, 3, 14).unwrap().and_hms_opt(0, 5, 0)
        );
        assert_eq!(
            parse_start_time("Sep 05", today()),
            NaiveDate::from_ymd_opt(2026, 9, 5).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(
            parse_start_time("Sep05", today()),
            NaiveDate::from_ymd_opt(2026, 9, 5).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(
            parse_start_time("Sep 05 15:58", today()),
            NaiveDate::from_ymd_opt(2026, 9, 5).unwrap().and_hms_opt(15, 58, 0)
        );
    }

    #[test]
    fn start_time_rejects_unknown_or_invalid_values() {
        assert_eq!(parse_start_time("yesterday", today()), None);
        assert_eq!(parse_start_time("13:00PM", today()), None);
        assert_eq!(parse_start_time("Foo 05", today()), None);
        assert_eq!(parse_start_time("Feb 30", today()), None);
    }

    #[test]
    fn ps_line_parses_fields_and_keeps_unparsable_start() {
        let line = "pete  4242  1.0  2.0  400000  2048  s001  S+  3:58PM  0:01.00 node /opt/claude-code/cli.js --verbose";
        let parsed = parse_ps_line(line, today()).expect("record");
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.memory_bytes, 2048 * 1024);
        assert_eq!(parsed.command, "node /opt/claude-code/cli.js --verbose");
        assert!(parsed.start_time.is_some());

        let line = "pete  4243  1.0  2.0  400000  2048  s001  S+  ??  0:01.00 claude";
        let parsed = parse_ps_line(line, today()).expect("record");
        assert!(parsed.start_time.is_none());
    }

    #[test]
    fn ps_line_skips_header_and_short_lines() {
        let header = "USER PID %CPU %MEM VSZ RSS TT STAT STARTED TIME COMMAND";
        assert!(parse_ps_line(header, today()).is_none());
        assert!(parse_ps_line("too short", today()).is_none());
    }
}
