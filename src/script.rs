//! Legacy per-source extraction programs.
//!
//! Some sources are handled by bespoke external programs rather than the
//! native feed pipeline. The contract with those programs is fixed:
//!
//! - nothing is written to stdin;
//! - the process must finish within the configured timeout or it is killed;
//! - on exit code 0, the last non-empty line of output must be three
//!   whitespace-separated integers: `<retrieved> <failed> <stored>`.
//!   stdout and stderr are merged line by line in the order they arrive, so
//!   the contract line may be written to either stream.
//!
//! Any deviation yields a sentinel [`PollStatus`] with zero counts.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::models::{PollCounts, PollOutcome};
use crate::status::PollStatus;

/// Narrow interface over the legacy program invocation, so the orchestrator
/// does not care whether a source is handled by a subprocess or something else.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn invoke(&self, path: &Path, timeout: Duration) -> PollOutcome;
}

/// Runs the program as a child process.
pub struct ProcessScriptRunner;

#[async_trait]
impl ScriptRunner for ProcessScriptRunner {
    async fn invoke(&self, path: &Path, timeout: Duration) -> PollOutcome {
        info!(script = %path.display(), "invoking source script");

        let mut child = match Command::new(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(script = %path.display(), error = %e, "could not spawn script");
                return PollOutcome::failed(PollStatus::ScriptFailed);
            }
        };

        let output = Arc::new(Mutex::new(Vec::new()));
        let stdout = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_lines(s, output.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_lines(s, output.clone())));

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!(script = %path.display(), error = %e, "waiting on script failed");
                return PollOutcome::failed(PollStatus::ScriptFailed);
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(script = %path.display(), error = %e, "could not kill timed-out script");
                }
                error!(
                    script = %path.display(),
                    timeout_secs = timeout.as_secs(),
                    "script timed out"
                );
                return PollOutcome::failed(PollStatus::ScriptTimeout);
            }
        };

        drain(stdout).await;
        drain(stderr).await;

        if !status.success() {
            error!(script = %path.display(), code = ?status.code(), "script returned an error");
            return match status.code() {
                Some(code) => PollOutcome::failed(PollStatus::ScriptExit(code)),
                None => PollOutcome::failed(PollStatus::ScriptFailed),
            };
        }

        let combined = match output.lock() {
            Ok(lines) => lines.join("\n"),
            Err(poisoned) => poisoned.into_inner().join("\n"),
        };
        match parse_contract(&combined) {
            Some(counts) => PollOutcome {
                status: PollStatus::Http(200),
                counts,
            },
            None => {
                error!(
                    script = %path.display(),
                    last_line = last_line(&combined).unwrap_or(""),
                    "script output not in `retrieved failed stored` format"
                );
                PollOutcome::failed(PollStatus::ScriptMalformed)
            }
        }
    }
}

/// Append each line of `reader` to the shared output as soon as it is read.
async fn read_lines<R: AsyncRead + Unpin>(reader: R, output: Arc<Mutex<Vec<String>>>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if let Ok(mut lines) = output.lock() {
                    lines.push(line);
                }
            }
        }
    }
}

async fn drain(handle: Option<tokio::task::JoinHandle<()>>) {
    if let Some(h) = handle {
        let _ = h.await;
    }
}

fn last_line(output: &str) -> Option<&str> {
    output.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

/// Parse the `<retrieved> <failed> <stored>` line that ends the output.
pub fn parse_contract(output: &str) -> Option<PollCounts> {
    let line = last_line(output)?;
    let fields: Vec<i64> = line
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;

    match fields.as_slice() {
        [retrieved, failed, stored] => Some(PollCounts {
            retrieved: *retrieved,
            failed: *failed,
            stored: *stored,
        }),
        _ => None,
    }
}
