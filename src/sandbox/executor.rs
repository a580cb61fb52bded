use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::config::types::SandboxPolicy;
use crate::error::Result;
use crate::events::{self, EventSink, Level, ProgressEvent};
use crate::sandbox::artifacts::{self, Artifact};
use crate::sandbox::container::ContainerHandle;
use crate::sandbox::monitor::{PeakStats, StatsMonitor, StatsSample};
use crate::sandbox::registry::{SandboxRegistry, SessionId};
use crate::sandbox::runner::{self, Language};

/// Preview length for the code-preview event
const PREVIEW_CHARS: usize = 200;

/// Delay between the two samples of an on-demand stats probe. Long enough
/// for the CPU counters to move, short enough to feel instant.
const STATS_PROBE_DELAY: Duration = Duration::from_millis(200);

/// Complete record of one code execution in a session sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub language: String,
    pub output: String,
    pub exit_code: i64,
    pub duration_secs: f64,
    pub peak_cpu_percent: f64,
    pub peak_memory_bytes: u64,
    pub artifacts: Vec<Artifact>,
    pub container_id: Option<String>,
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn failed_before_start(language: &str, message: String) -> Self {
        Self {
            language: language.to_string(),
            output: message,
            exit_code: 1,
            duration_secs: 0.0,
            peak_cpu_percent: 0.0,
            peak_memory_bytes: 0,
            artifacts: Vec::new(),
            container_id: None,
            timed_out: false,
        }
    }
}

/// Seam between the orchestrator and callers that drive executions in a
/// loop, letting the auto-fix machinery run against a scripted executor
/// in tests.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(
        &self,
        session: SessionId,
        language_tag: &str,
        source: &str,
        sink: &EventSink,
    ) -> Result<ExecutionResult>;
}

/// Orchestrates a full execution: container acquisition, code injection,
/// timeout-bounded run, resource sampling and artifact collection.
pub struct Engine {
    registry: SandboxRegistry,
    policy: SandboxPolicy,
}

impl Engine {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self {
            registry: SandboxRegistry::new(policy.clone()),
            policy,
        }
    }

    /// Run `source` in the session's sandbox, streaming progress events to
    /// `sink`. Program failures (non-zero exit, timeout, unknown language)
    /// come back as an [`ExecutionResult`]; only infrastructure failures
    /// (daemon down, container cannot start) are `Err`.
    pub async fn execute(
        &self,
        session: SessionId,
        language_tag: &str,
        source: &str,
        sink: &EventSink,
    ) -> Result<ExecutionResult> {
        let language: Language = match language_tag.parse() {
            Ok(language) => language,
            Err(e) => {
                events::feedback(sink, Level::Error, e.to_string());
                return Ok(ExecutionResult::failed_before_start(
                    language_tag,
                    e.to_string(),
                ));
            }
        };

        if !self.registry.contains(session).await {
            events::feedback(sink, Level::Info, "Creating sandbox container...");
        }

        let acquire_started = std::time::Instant::now();
        let (container, created) = self.registry.acquire(session).await?;
        if created {
            events::feedback(
                sink,
                Level::Success,
                format!(
                    "Container started ({}) in {:.1}s",
                    container.short_id(),
                    acquire_started.elapsed().as_secs_f64()
                ),
            );
        }

        events::feedback(sink, Level::Info, format!("Writing {} code...", language));
        events::emit(
            sink,
            ProgressEvent::CodePreview {
                language: language.as_str().to_string(),
                content: preview(source),
            },
        );

        let before = artifacts::snapshot(&container).await;

        events::emit(
            sink,
            ProgressEvent::ExecutionStart {
                language: language.as_str().to_string(),
            },
        );
        events::feedback(sink, Level::Info, "Executing...");

        let (cancel, peaks) = spawn_sampler(container.clone(), self.policy.sample_interval_ms);

        let run = runner::inject_and_run(&container, language, source, self.policy.timeout_seconds)
            .await;

        let _ = cancel.send(());
        let peaks = peaks.await.unwrap_or_default();

        let outcome = match run {
            Ok(outcome) => outcome,
            Err(e) => {
                events::feedback(sink, Level::Error, e.to_string());
                return Ok(ExecutionResult {
                    container_id: Some(container.id.clone()),
                    peak_cpu_percent: peaks.cpu_percent,
                    peak_memory_bytes: peaks.memory_bytes,
                    ..ExecutionResult::failed_before_start(language.as_str(), e.to_string())
                });
            }
        };

        // Without both listings the diff would misreport pre-existing files
        // as new, so artifact collection is skipped entirely.
        let mut collected = Vec::new();
        if let Some(before) = &before {
            events::feedback(sink, Level::Info, "Checking for created files...");
            if let Some(after) = artifacts::snapshot(&container).await {
                let new_files = artifacts::diff(before, &after, &outcome.filename);
                if !new_files.is_empty() {
                    events::feedback(
                        sink,
                        Level::Success,
                        format!("Found {} new file(s)", new_files.len()),
                    );
                }
                collected = artifacts::read_all(&container, &new_files).await;
            }
        }

        let duration_secs = outcome.duration.as_secs_f64();
        events::emit(
            sink,
            ProgressEvent::ExecutionEnd {
                exit_code: outcome.exit_code,
                duration_secs,
            },
        );

        if outcome.timed_out {
            events::feedback(
                sink,
                Level::Error,
                format!(
                    "Execution timed out after {}s",
                    self.policy.timeout_seconds
                ),
            );
        } else if outcome.exit_code == 0 {
            events::feedback(
                sink,
                Level::Success,
                format!("Execution completed in {:.1}s", duration_secs),
            );
        } else {
            events::feedback(
                sink,
                Level::Error,
                format!("Execution failed with exit code {}", outcome.exit_code),
            );
        }

        info!(
            session = session,
            language = %language,
            exit_code = outcome.exit_code,
            duration_secs = duration_secs,
            artifacts = collected.len(),
            "Execution finished"
        );

        Ok(ExecutionResult {
            language: language.as_str().to_string(),
            output: outcome.output,
            exit_code: outcome.exit_code,
            duration_secs,
            peak_cpu_percent: peaks.cpu_percent,
            peak_memory_bytes: peaks.memory_bytes,
            artifacts: collected,
            container_id: Some(container.id),
            timed_out: outcome.timed_out,
        })
    }

    /// On-demand resource snapshot of the session's container. `None` when
    /// the session has no live container.
    pub async fn stats(&self, session: SessionId) -> Option<StatsSample> {
        let container = self.registry.get(session).await?;
        let mut monitor = StatsMonitor::new();
        // First read seeds the CPU counters, second read carries the rate
        monitor.sample_once(&container).await?;
        tokio::time::sleep(STATS_PROBE_DELAY).await;
        monitor.sample_once(&container).await
    }

    pub async fn release(&self, session: SessionId) {
        self.registry.release(session).await;
    }

    pub async fn release_all(&self) {
        self.registry.release_all().await;
    }
}

#[async_trait]
impl CodeExecutor for Engine {
    async fn execute(
        &self,
        session: SessionId,
        language_tag: &str,
        source: &str,
        sink: &EventSink,
    ) -> Result<ExecutionResult> {
        Engine::execute(self, session, language_tag, source, sink).await
    }
}

/// Background task sampling the container at the configured interval until
/// cancelled, folding readings into running peaks.
fn spawn_sampler(
    container: ContainerHandle,
    interval_ms: u64,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<PeakStats>) {
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let mut monitor = StatsMonitor::new();
        let mut peaks = PeakStats::default();
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut cancel_rx => break,
                _ = ticker.tick() => {
                    match monitor.sample_once(&container).await {
                        Some(sample) => peaks.fold(&sample),
                        None => debug!(container_id = %container.short_id(), "Sampler skipped a reading"),
                    }
                }
            }
        }
        peaks
    });
    (cancel_tx, handle)
}

fn preview(source: &str) -> String {
    if source.chars().count() <= PREVIEW_CHARS {
        source.to_string()
    } else {
        let truncated: String = source.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", truncated)
    }
}

/// Shared engine handle the CLI and auto-fix loop hold together.
pub type SharedEngine = Arc<Engine>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::channel;

    #[test]
    fn test_preview_truncates_long_source() {
        let short = "print('hi')";
        assert_eq!(preview(short), short);

        let long = "x".repeat(500);
        let p = preview(&long);
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert!(p.ends_with("..."));
    }

    #[test]
    fn test_failed_before_start_shape() {
        let result = ExecutionResult::failed_before_start("rust", "Unsupported language".into());
        assert_eq!(result.exit_code, 1);
        assert!(!result.success());
        assert!(result.artifacts.is_empty());
        assert!(result.container_id.is_none());
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_unknown_language_is_a_result_not_an_error() {
        let engine = Engine::new(SandboxPolicy::default());
        let (sink, mut rx) = channel();
        let result = engine.execute(1, "cobol", "DISPLAY 'HI'", &sink).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.language, "cobol");
        assert!(result.output.contains("cobol"));

        drop(sink);
        let first = rx.recv().await.unwrap();
        assert!(matches!(
            first,
            ProgressEvent::Feedback {
                level: Level::Error,
                ..
            }
        ));
    }
}
