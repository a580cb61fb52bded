pub mod prompt;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::types::AutoFixPolicy;
use crate::events::{self, EventSink, FixPhase, ProgressEvent};
use crate::extract::extract_code_blocks;
use crate::providers::{AiProvider, Message};
use crate::sandbox::{CodeExecutor, ExecutionResult, Language, SessionId};

pub use prompt::render_repair_prompt;

pub const NO_CODE_REASON: &str = "No code blocks in response";

/// State of the remediation loop. Non-idle states carry the attempt number
/// they belong to, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixState {
    Idle,
    /// Building the repair prompt from the last failure
    Analyzing { attempt: u32 },
    /// Waiting on the model, then executing its replacement code
    Fixing { attempt: u32 },
    Success { attempt: u32 },
    Exhausted { attempt: u32 },
    Aborted { attempt: u32, reason: String },
}

impl FixState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FixState::Success { .. } | FixState::Exhausted { .. } | FixState::Aborted { .. }
        )
    }
}

/// Whether a finished execution should start the remediation loop. Setup
/// snippets (shell) are excluded: a failed pip install is an environment
/// problem, not a code bug.
pub fn should_enter(policy: &AutoFixPolicy, last: &ExecutionResult) -> bool {
    if !policy.enabled || last.success() {
        return false;
    }
    match last.language.parse::<Language>() {
        Ok(language) => !language.is_setup(),
        Err(_) => false,
    }
}

/// Exit status that decides a batch's fate. By default only the LAST
/// execution counts, earlier blocks being treated as scaffolding for the
/// final one; `all_blocks_must_pass` makes the first non-zero exit decide.
pub fn batch_exit_code(policy: &AutoFixPolicy, batch: &[ExecutionResult]) -> i64 {
    if policy.all_blocks_must_pass {
        batch
            .iter()
            .map(|r| r.exit_code)
            .find(|code| *code != 0)
            .unwrap_or(0)
    } else {
        batch.last().map(|r| r.exit_code).unwrap_or(0)
    }
}

/// Transition after executing one batch of replacement blocks.
pub fn after_batch(attempt: u32, max_attempts: u32, last_exit_code: i64) -> FixState {
    if last_exit_code == 0 {
        FixState::Success { attempt }
    } else if attempt < max_attempts {
        FixState::Analyzing {
            attempt: attempt + 1,
        }
    } else {
        FixState::Exhausted { attempt }
    }
}

/// Outcome of one full remediation loop.
#[derive(Debug)]
pub struct FixReport {
    pub state: FixState,
    /// Every execution performed across all attempts, in order
    pub results: Vec<ExecutionResult>,
}

impl FixReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.state, FixState::Success { .. })
    }
}

/// Drives generate -> execute -> diagnose cycles until the last execution
/// of a batch succeeds, attempts run out, or the loop aborts.
pub struct AutoFixer {
    engine: Arc<dyn CodeExecutor>,
    provider: Arc<dyn AiProvider>,
    policy: AutoFixPolicy,
}

impl AutoFixer {
    pub fn new(
        engine: Arc<dyn CodeExecutor>,
        provider: Arc<dyn AiProvider>,
        policy: AutoFixPolicy,
    ) -> Self {
        Self {
            engine,
            provider,
            policy,
        }
    }

    /// Run the loop for `failure`, extending `history` with the repair
    /// prompts and model replies so later turns see the whole exchange.
    pub async fn run(
        &self,
        session: SessionId,
        failure: &ExecutionResult,
        history: &mut Vec<Message>,
        sink: &EventSink,
    ) -> FixReport {
        let max_attempts = self.policy.max_attempts;
        let mut current_failure = failure.clone();
        let mut results = Vec::new();
        let mut state = FixState::Analyzing { attempt: 1 };

        loop {
            let attempt = match &state {
                FixState::Analyzing { attempt } => *attempt,
                _ => break,
            };

            events::emit(
                sink,
                ProgressEvent::AutoFix {
                    status: FixPhase::Analyzing,
                    attempt,
                    max_attempts,
                },
            );

            let prompt = render_repair_prompt(&self.policy.prompt_template, &current_failure);
            events::emit(
                sink,
                ProgressEvent::AutoFixPrompt {
                    content: prompt.clone(),
                    attempt,
                },
            );
            history.push(Message::user(prompt));

            state = FixState::Fixing { attempt };
            events::emit(
                sink,
                ProgressEvent::AutoFix {
                    status: FixPhase::Fixing,
                    attempt,
                    max_attempts,
                },
            );

            let response = match self.provider.complete(history, None).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(session = session, attempt = attempt, error = %e, "Fix attempt aborted");
                    state = FixState::Aborted {
                        attempt,
                        reason: e.to_string(),
                    };
                    break;
                }
            };
            history.push(Message::assistant(response.clone()));

            let blocks = extract_code_blocks(&response);
            if blocks.is_empty() {
                state = FixState::Aborted {
                    attempt,
                    reason: NO_CODE_REASON.to_string(),
                };
                break;
            }

            let mut batch = Vec::new();
            for block in &blocks {
                match self
                    .engine
                    .execute(session, &block.language, &block.code, sink)
                    .await
                {
                    Ok(result) => batch.push(result),
                    Err(e) => {
                        state = FixState::Aborted {
                            attempt,
                            reason: e.to_string(),
                        };
                        break;
                    }
                }
            }
            if state.is_terminal() {
                results.extend(batch);
                break;
            }

            let deciding_exit = batch_exit_code(&self.policy, &batch);
            // Next repair prompt references the failing execution, falling
            // back to the batch's last one.
            let failing_reference = batch
                .iter()
                .rev()
                .find(|r| r.exit_code != 0)
                .or_else(|| batch.last())
                .cloned();
            results.extend(batch);

            state = after_batch(attempt, max_attempts, deciding_exit);
            match &state {
                FixState::Analyzing { .. } => {
                    // The retry event names the attempt that just failed
                    events::emit(
                        sink,
                        ProgressEvent::AutoFixRetry {
                            attempt,
                            max_attempts,
                        },
                    );
                    if let Some(reference) = failing_reference {
                        current_failure = reference;
                    }
                }
                _ => break,
            }
        }

        match &state {
            FixState::Success { attempt } => {
                info!(session = session, attempt = attempt, "Auto-fix succeeded");
                events::emit(
                    sink,
                    ProgressEvent::AutoFixComplete {
                        success: true,
                        attempt: *attempt,
                        reason: None,
                    },
                );
            }
            FixState::Exhausted { attempt } => {
                events::emit(
                    sink,
                    ProgressEvent::AutoFixComplete {
                        success: false,
                        attempt: *attempt,
                        reason: Some(format!("Max attempts ({}) reached", max_attempts)),
                    },
                );
            }
            FixState::Aborted { attempt, reason } => {
                events::emit(
                    sink,
                    ProgressEvent::AutoFixComplete {
                        success: false,
                        attempt: *attempt,
                        reason: Some(reason.clone()),
                    },
                );
            }
            _ => {}
        }

        FixReport { state, results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use crate::error::RunletError;
    use crate::events::channel;

    fn result(language: &str, exit_code: i64) -> ExecutionResult {
        ExecutionResult {
            language: language.to_string(),
            output: String::new(),
            exit_code,
            duration_secs: 0.1,
            peak_cpu_percent: 0.0,
            peak_memory_bytes: 0,
            artifacts: Vec::new(),
            container_id: None,
            timed_out: false,
        }
    }

    #[test]
    fn test_should_enter_only_on_code_failures() {
        let policy = AutoFixPolicy::default();
        assert!(should_enter(&policy, &result("python", 1)));
        assert!(should_enter(&policy, &result("javascript", 2)));
        assert!(!should_enter(&policy, &result("python", 0)));
        // Shell snippets are setup, never repaired
        assert!(!should_enter(&policy, &result("bash", 1)));
        assert!(!should_enter(&policy, &result("cobol", 1)));
    }

    #[test]
    fn test_should_enter_respects_disabled_policy() {
        let policy = AutoFixPolicy {
            enabled: false,
            ..Default::default()
        };
        assert!(!should_enter(&policy, &result("python", 1)));
    }

    #[test]
    fn test_batch_exit_defaults_to_last_block() {
        let policy = AutoFixPolicy::default();
        let batch = vec![result("bash", 1), result("python", 0)];
        assert_eq!(batch_exit_code(&policy, &batch), 0);

        let batch = vec![result("bash", 0), result("python", 2)];
        assert_eq!(batch_exit_code(&policy, &batch), 2);
    }

    #[test]
    fn test_batch_exit_all_blocks_mode() {
        let policy = AutoFixPolicy {
            all_blocks_must_pass: true,
            ..Default::default()
        };
        let batch = vec![result("bash", 1), result("python", 0)];
        assert_eq!(batch_exit_code(&policy, &batch), 1);

        let batch = vec![result("bash", 0), result("python", 0)];
        assert_eq!(batch_exit_code(&policy, &batch), 0);
    }

    #[test]
    fn test_after_batch_success() {
        assert_eq!(after_batch(3, 10, 0), FixState::Success { attempt: 3 });
    }

    #[test]
    fn test_after_batch_retry_increments_attempt() {
        assert_eq!(after_batch(1, 10, 1), FixState::Analyzing { attempt: 2 });
        assert_eq!(after_batch(9, 10, 1), FixState::Analyzing { attempt: 10 });
    }

    #[test]
    fn test_after_batch_exhausts_at_max() {
        assert_eq!(after_batch(10, 10, 1), FixState::Exhausted { attempt: 10 });
        assert_eq!(after_batch(1, 1, 1), FixState::Exhausted { attempt: 1 });
    }

    #[test]
    fn test_attempts_never_exceed_max() {
        // Walking the machine from attempt 1 with only failures terminates
        // in Exhausted at exactly max_attempts.
        let max = 10;
        let mut attempt = 1;
        let mut cycles = 0;
        loop {
            cycles += 1;
            match after_batch(attempt, max, 1) {
                FixState::Analyzing { attempt: next } => attempt = next,
                FixState::Exhausted { attempt: last } => {
                    assert_eq!(last, max);
                    break;
                }
                other => panic!("unexpected state {:?}", other),
            }
        }
        assert_eq!(cycles, max);
    }

    /// Executor replaying a fixed sequence of exit codes.
    struct ScriptedExecutor {
        exits: Mutex<VecDeque<i64>>,
    }

    impl ScriptedExecutor {
        fn new(exits: impl IntoIterator<Item = i64>) -> Arc<Self> {
            Arc::new(Self {
                exits: Mutex::new(exits.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl CodeExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _session: SessionId,
            language_tag: &str,
            _source: &str,
            _sink: &EventSink,
        ) -> crate::error::Result<ExecutionResult> {
            let exit = self.exits.lock().unwrap().pop_front().unwrap_or(0);
            Ok(result(language_tag, exit))
        }
    }

    /// Provider replaying canned completions, erroring once exhausted.
    struct ScriptedProvider {
        replies: Mutex<VecDeque<String>>,
    }

    impl ScriptedProvider {
        fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            })
        }
    }

    #[async_trait]
    impl AiProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _messages: &[Message],
            _system_prompt: Option<&str>,
        ) -> crate::error::Result<String> {
            self.replies.lock().unwrap().pop_front().ok_or_else(|| {
                RunletError::ProviderApi {
                    message: "no replies left".to_string(),
                    status: None,
                }
            })
        }
    }

    fn drain(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>,
    ) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_retry_event_names_the_failed_attempt() {
        // Attempt 1 fails, attempt 2 succeeds
        let fixer = AutoFixer::new(
            ScriptedExecutor::new([1, 0]),
            ScriptedProvider::new(["```python\nx = 1\n```", "```python\nx = 2\n```"]),
            AutoFixPolicy::default(),
        );
        let (sink, mut rx) = channel();
        let mut history = vec![Message::user("go")];

        let report = fixer.run(7, &result("python", 1), &mut history, &sink).await;

        assert_eq!(report.state, FixState::Success { attempt: 2 });
        let retries: Vec<u32> = drain(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                ProgressEvent::AutoFixRetry { attempt, .. } => Some(attempt),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1]);
    }

    #[tokio::test]
    async fn test_loop_aborts_when_reply_has_no_code() {
        let fixer = AutoFixer::new(
            ScriptedExecutor::new([]),
            ScriptedProvider::new(["sorry, no code here"]),
            AutoFixPolicy::default(),
        );
        let (sink, mut rx) = channel();
        let mut history = Vec::new();

        let report = fixer.run(7, &result("python", 1), &mut history, &sink).await;

        assert_eq!(
            report.state,
            FixState::Aborted {
                attempt: 1,
                reason: NO_CODE_REASON.to_string()
            }
        );
        assert!(report.results.is_empty());
        let complete = drain(&mut rx).into_iter().find_map(|ev| match ev {
            ProgressEvent::AutoFixComplete {
                success, reason, ..
            } => Some((success, reason)),
            _ => None,
        });
        assert_eq!(complete, Some((false, Some(NO_CODE_REASON.to_string()))));
    }

    #[tokio::test]
    async fn test_loop_exhausts_at_the_attempt_cap() {
        let policy = AutoFixPolicy {
            max_attempts: 2,
            ..Default::default()
        };
        let fixer = AutoFixer::new(
            ScriptedExecutor::new([1, 1]),
            ScriptedProvider::new(["```python\na\n```", "```python\nb\n```"]),
            policy,
        );
        let (sink, mut rx) = channel();
        let mut history = Vec::new();

        let report = fixer.run(7, &result("python", 1), &mut history, &sink).await;

        assert_eq!(report.state, FixState::Exhausted { attempt: 2 });
        assert_eq!(report.results.len(), 2);
        // Conversation gained one user and one assistant turn per attempt
        assert_eq!(history.len(), 4);
        drop(rx);
        drop(sink);
    }

    #[test]
    fn test_terminal_states() {
        assert!(FixState::Success { attempt: 1 }.is_terminal());
        assert!(FixState::Exhausted { attempt: 10 }.is_terminal());
        assert!(FixState::Aborted {
            attempt: 1,
            reason: NO_CODE_REASON.to_string()
        }
        .is_terminal());
        assert!(!FixState::Idle.is_terminal());
        assert!(!FixState::Analyzing { attempt: 1 }.is_terminal());
        assert!(!FixState::Fixing { attempt: 1 }.is_terminal());
    }
}
