use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{Result, RunletError};
use crate::sandbox::container::ContainerHandle;

/// Exit code reported for any run that hit the time limit.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Exit code of a process terminated by SIGKILL, as `timeout --signal=KILL`
/// surfaces it. Folded into [`TIMEOUT_EXIT_CODE`].
const SIGKILL_EXIT_CODE: i64 = 137;

/// Languages the sandbox can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    Bash,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Bash => "bash",
        }
    }

    pub fn interpreter(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "node",
            Language::Bash => "bash",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::Bash => "sh",
        }
    }

    /// Shell snippets are environment setup (pip install, apt-get), not
    /// program code, so failures in them are not candidates for repair.
    pub fn is_setup(&self) -> bool {
        matches!(self, Language::Bash)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = RunletError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            other => Err(RunletError::UnsupportedLanguage {
                language: other.to_string(),
            }),
        }
    }
}

/// Outcome of one injected run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Name of the script file written into the workspace
    pub filename: String,
    pub output: String,
    pub exit_code: i64,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Millisecond-resolution script name, unique per run within a session.
pub fn script_filename(language: Language, now: DateTime<Utc>) -> String {
    format!(
        "script_{}.{}",
        now.format("%Y%m%d_%H%M%S_%3f"),
        language.extension()
    )
}

/// Shell command that runs the script under a hard time limit. SIGKILL
/// rather than TERM so runaway interpreters cannot ignore it.
fn build_command(language: Language, filename: &str, timeout_secs: u64) -> String {
    format!(
        "timeout --signal=KILL {} {} {}",
        timeout_secs,
        language.interpreter(),
        filename
    )
}

/// `timeout` reports 124 on expiry; a SIGKILL-ed child reports 137. Both
/// mean the limit was hit.
fn normalize_exit(exit_code: i64) -> (i64, bool) {
    if exit_code == TIMEOUT_EXIT_CODE || exit_code == SIGKILL_EXIT_CODE {
        (TIMEOUT_EXIT_CODE, true)
    } else {
        (exit_code, false)
    }
}

/// Outer guard for the case where the in-container `timeout` never returns
/// (docker exec wedged, PID 1 reaping issues). Generous on purpose. `None`
/// when a zero timeout disables the wrapper: an unlimited run must not be
/// killed by its own safety net.
fn backstop(timeout_secs: u64) -> Option<Duration> {
    if timeout_secs > 0 {
        Some(Duration::from_secs(timeout_secs * 2 + 30))
    } else {
        None
    }
}

/// Write the source into the container and run it under the time limit.
pub async fn inject_and_run(
    container: &ContainerHandle,
    language: Language,
    source: &str,
    timeout_secs: u64,
) -> Result<RunOutcome> {
    let filename = script_filename(language, Utc::now());
    container.write_file(&filename, source).await?;

    let command = build_command(language, &filename, timeout_secs);
    debug!(container_id = %container.short_id(), filename = %filename, "Running script");

    let started = Instant::now();
    let exec = match backstop(timeout_secs) {
        Some(limit) => tokio::time::timeout(limit, container.exec_sh(&command)).await,
        None => Ok(container.exec_sh(&command).await),
    };
    let duration = started.elapsed();

    match exec {
        Ok(result) => {
            let result = result?;
            let (exit_code, timed_out) = normalize_exit(result.exit_code);
            let mut output = result.combined_output();
            if timed_out {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&format!(
                    "Execution timeout ({}s exceeded) - process killed.",
                    timeout_secs
                ));
            }
            Ok(RunOutcome {
                filename,
                output,
                exit_code,
                duration,
                timed_out,
            })
        }
        Err(_) => {
            warn!(
                container_id = %container.short_id(),
                timeout_secs = timeout_secs,
                "In-container timeout did not fire, killing interpreters"
            );
            kill_runaways(container).await;
            Ok(RunOutcome {
                filename,
                output: format!(
                    "Execution timeout ({}s exceeded) - process killed.",
                    timeout_secs
                ),
                exit_code: TIMEOUT_EXIT_CODE,
                duration,
                timed_out: true,
            })
        }
    }
}

/// Kill every interpreter process in the container. Used only when the
/// in-container timeout failed to enforce the limit.
async fn kill_runaways(container: &ContainerHandle) {
    for name in ["python", "node", "bash"] {
        if let Err(e) = container.exec(&["pkill", "-9", "-f", name]).await {
            debug!(process = name, error = %e, "pkill failed");
        }
    }
}
