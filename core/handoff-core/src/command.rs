//! Timeout-bounded execution of external commands.
//!
//! Every external call made by the monitor goes through [`run_with_timeout`];
//! a child that outlives its deadline is killed and reported as
//! [`HandoffError::CommandTimedOut`].

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::error::{HandoffError, Result};

const OUTPUT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout and stderr joined, for pattern scanning.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

pub fn run_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: Option<&Path>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let display = command_display(program, args);

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|err| HandoffError::CommandFailed {
        command: display.clone(),
        details: err.to_string(),
    })?;

    // Drain pipes while waiting so a chatty child cannot block on a full pipe.
    let stdout_rx = drain(child.stdout.take());
    let stderr_rx = drain(child.stderr.take());

    let status = child
        .wait_timeout(timeout)
        .map_err(|err| HandoffError::CommandFailed {
            command: display.clone(),
            details: err.to_string(),
        })?;

    let Some(status) = status else {
        kill_child(&mut child);
        return Err(HandoffError::CommandTimedOut {
            command: display,
            timeout_secs: timeout.as_secs(),
        });
    };

    let stdout = stdout_rx
        .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
        .unwrap_or_default();
    let stderr = stderr_rx
        .recv_timeout(OUTPUT_COLLECTION_TIMEOUT)
        .unwrap_or_default();

    Ok(CommandOutput {
        success: status.success(),
        exit_code: status.code(),
        stdout,
        stderr,
    })
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    match stream {
        Some(mut stream) => {
            thread::spawn(move || {
                let mut buffer = Vec::new();
                let _ = stream.read_to_end(&mut buffer);
                let _ = tx.send(String::from_utf8_lossy(&buffer).into_owned());
            });
        }
        None => {
            let _ = tx.send(String::new());
        }
    }
    rx
}

fn kill_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn command_display(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let output = run_with_timeout("sh", &["-c", "echo hello; exit 3"], None, Duration::from_secs(5))
            .expect("run");
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn combined_includes_stderr() {
        let output = run_with_timeout("sh", &["-c", "echo out; echo err 1>&2"], None, Duration::from_secs(5))
            .expect("run");
        let combined = output.combined();
        assert!(combined.contains("out"));
        assert!(combined.contains("err"));
    }

    #[test]
    fn kills_child_after_timeout() {
        let err = run_with_timeout("sleep", &["5"], None, Duration::from_millis(100))
            .expect_err("timeout");
        assert!(matches!(err, HandoffError::CommandTimedOut { .. }));
    }

    #[test]
    fn missing_program_is_command_failed() {
        let err = run_with_timeout(
            "definitely-not-a-real-binary-handoff",
            &[],
            None,
            Duration::from_secs(1),
        )
        .expect_err("spawn failure");
        assert!(matches!(err, HandoffError::CommandFailed { .. }));
    }
}
