use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::autofix::{self, AutoFixer, FixState};
use crate::cli::args::{
    AskArgs, ConfigAction, ConfigArgs, InitArgs, OutputFormat, ReleaseArgs, RunArgs, StatsArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::RunletConfig;
use crate::error::{Result, RunletError};
use crate::events::{self, Level, ProgressEvent};
use crate::extract::extract_code_blocks;
use crate::providers::registry::create_provider;
use crate::providers::Message;
use crate::sandbox::{Engine, ExecutionResult, SandboxRegistry, SharedEngine, StatsSample};

const SYSTEM_PROMPT: &str = "You are a coding assistant with access to a sandboxed execution \
environment supporting python, javascript and bash. Reply with complete, runnable programs in \
fenced code blocks. Use bash blocks only for package installation.";

// ============================================================================
// Execution Commands
// ============================================================================

/// Execute a code file or inline snippet in a session's sandbox
pub async fn run(args: RunArgs, config: RunletConfig, format: OutputFormat) -> Result<()> {
    let source = match (&args.file, &args.code) {
        (Some(path), None) => std::fs::read_to_string(path)?,
        (None, Some(code)) => code.clone(),
        _ => {
            return Err(RunletError::Config(
                "Provide a code file or --code".to_string(),
            ))
        }
    };

    ensure_docker()?;
    info!(session = args.session, lang = %args.lang, "Running code in session sandbox");

    let engine = Engine::new(config.sandbox);
    let (sink, rx) = events::channel();
    let printer = spawn_event_printer(rx, format.clone());

    let result = engine.execute(args.session, &args.lang, &source, &sink).await?;

    drop(sink);
    let _ = printer.await;

    output_execution_result(&result, &format);

    if result.exit_code != 0 {
        std::process::exit(result.exit_code as i32);
    }
    Ok(())
}

/// Ask an AI provider and execute the code it replies with
pub async fn ask(args: AskArgs, config: RunletConfig, format: OutputFormat) -> Result<()> {
    ensure_docker()?;
    info!(session = args.session, provider = %args.provider, "Starting ask pipeline");

    let provider = create_provider(&args.provider, args.model.as_deref(), &config)?;

    let mut policy = config.autofix.clone();
    if args.no_autofix {
        policy.enabled = false;
    }
    if let Some(max_attempts) = args.max_attempts {
        policy.max_attempts = max_attempts;
    }

    let engine: SharedEngine = Arc::new(Engine::new(config.sandbox.clone()));
    let (sink, rx) = events::channel();
    let printer = spawn_event_printer(rx, format.clone());

    let mut history = vec![Message::user(args.prompt.clone())];
    let response = provider.complete(&history, Some(SYSTEM_PROMPT)).await?;
    history.push(Message::assistant(response.clone()));

    let blocks = extract_code_blocks(&response);
    if blocks.is_empty() {
        drop(sink);
        let _ = printer.await;
        match format {
            OutputFormat::Text => println!("{}", response),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "response": response }));
            }
        }
        return Ok(());
    }

    let mut results = Vec::new();
    for block in &blocks {
        let result = engine
            .execute(args.session, &block.language, &block.code, &sink)
            .await?;
        results.push(result);
    }

    // Only the last execution of the batch decides whether repair starts;
    // earlier blocks are setup for it.
    let mut fix_state = None;
    if let Some(last) = results.last().cloned() {
        if autofix::should_enter(&policy, &last) {
            let fixer = AutoFixer::new(engine.clone(), provider.clone(), policy);
            let report = fixer.run(args.session, &last, &mut history, &sink).await;
            results.extend(report.results);
            fix_state = Some(report.state);
        }
    }

    drop(sink);
    let _ = printer.await;

    match format {
        OutputFormat::Text => {
            println!("{}", response.trim());
            for result in &results {
                println!();
                println!("--- {} (exit {}) ---", result.language, result.exit_code);
                if !result.output.is_empty() {
                    println!("{}", result.output);
                }
                for artifact in &result.artifacts {
                    println!("Created: {}", artifact.filename);
                }
            }
            if let Some(state) = &fix_state {
                println!();
                println!("{}", describe_fix_state(state));
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "response": response,
                    "results": results,
                    "autofix": fix_state.as_ref().map(fix_state_json),
                })
            );
        }
    }

    Ok(())
}

// ============================================================================
// Session Commands
// ============================================================================

/// Show a resource snapshot of a session's container
pub async fn stats(args: StatsArgs, config: RunletConfig, format: OutputFormat) -> Result<()> {
    ensure_docker()?;

    let engine = Engine::new(config.sandbox);
    match engine.stats(args.session).await {
        Some(sample) => output_stats(args.session, &sample, &format),
        None => match format {
            OutputFormat::Text => {
                println!("No active container for session {}", args.session);
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({ "session": args.session, "active": false })
                );
            }
        },
    }
    Ok(())
}

/// Stop and remove session containers
pub async fn release(args: ReleaseArgs, config: RunletConfig, format: OutputFormat) -> Result<()> {
    ensure_docker()?;

    let engine = Engine::new(config.sandbox);
    if args.all {
        let sessions = SandboxRegistry::active_sessions().await;
        engine.release_all().await;
        match format {
            OutputFormat::Text => {
                println!("Released {} session container(s)", sessions.len());
            }
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "released": sessions }));
            }
        }
    } else if let Some(session) = args.session {
        engine.release(session).await;
        match format {
            OutputFormat::Text => {
                println!("Session {} released", session);
            }
            OutputFormat::Json => {
                println!("{}", serde_json::json!({ "released": [session] }));
            }
        }
    } else {
        return Err(RunletError::Config(
            "Provide a session id or --all".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = RunletConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| RunletError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Run a snippet in session 1's sandbox");
    println!("  runlet run 1 --lang python -e \"print('hello')\"");
    println!();
    println!("  # Ask a model and execute its code");
    println!("  runlet ask \"plot a sine wave to sine.png\" --session 1");
    println!();
    println!("  # Watch the container's resource usage");
    println!("  runlet stats 1");
    println!();
    println!("  # Tear the container down when done");
    println!("  runlet release 1");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: RunletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| RunletError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn ensure_docker() -> Result<()> {
    if SandboxRegistry::is_available() {
        Ok(())
    } else {
        Err(RunletError::DockerUnavailable(
            "Docker daemon is not reachable".to_string(),
        ))
    }
}

/// Drain progress events to stderr (text) or stdout (json lines) so the
/// final result output stays clean.
fn spawn_event_printer(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    format: OutputFormat,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match format {
                OutputFormat::Text => render_event(&event),
                OutputFormat::Json => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                }
            }
        }
    })
}

fn render_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Feedback { message, level } => match level {
            Level::Info => eprintln!("  {}", message),
            Level::Success => eprintln!("+ {}", message),
            Level::Error => eprintln!("! {}", message),
        },
        ProgressEvent::AutoFix {
            status,
            attempt,
            max_attempts,
        } => {
            let phase = match status {
                crate::events::FixPhase::Analyzing => "analyzing failure",
                crate::events::FixPhase::Fixing => "requesting fix",
            };
            eprintln!("  Auto-fix {} (attempt {}/{})", phase, attempt, max_attempts);
        }
        ProgressEvent::AutoFixRetry {
            attempt,
            max_attempts,
        } => {
            eprintln!("  Still failing, retrying ({}/{})", attempt, max_attempts);
        }
        ProgressEvent::AutoFixComplete {
            success,
            attempt,
            reason,
        } => {
            if *success {
                eprintln!("+ Auto-fix succeeded on attempt {}", attempt);
            } else {
                let reason = reason.as_deref().unwrap_or("unknown");
                eprintln!("! Auto-fix gave up on attempt {}: {}", attempt, reason);
            }
        }
        ProgressEvent::Error { message } => eprintln!("! {}", message),
        // Start/end/preview/prompt events carry structure for UI clients;
        // the feedback lines already cover them in text mode.
        _ => {}
    }
}

fn output_execution_result(result: &ExecutionResult, format: &OutputFormat) {
    match format {
        OutputFormat::Text => {
            if !result.output.is_empty() {
                println!("{}", result.output);
            }
            for artifact in &result.artifacts {
                eprintln!("Created: {}", artifact.filename);
            }
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(result) {
                println!("{}", json);
            }
        }
    }
}

fn output_stats(session: u64, sample: &StatsSample, format: &OutputFormat) {
    match format {
        OutputFormat::Text => {
            println!("Session {}", session);
            println!("  CPU:     {:.1}%", sample.cpu_percent);
            println!(
                "  Memory:  {} / {} ({:.1}%)",
                format_bytes(sample.memory_bytes),
                format_bytes(sample.memory_limit_bytes),
                sample.memory_percent
            );
            println!(
                "  Network: {} received, {} sent",
                format_bytes(sample.network_rx_bytes),
                format_bytes(sample.network_tx_bytes)
            );
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(sample) {
                println!("{}", json);
            }
        }
    }
}

fn describe_fix_state(state: &FixState) -> String {
    match state {
        FixState::Success { attempt } => {
            format!("Auto-fix succeeded after {} attempt(s)", attempt)
        }
        FixState::Exhausted { attempt } => {
            format!("Auto-fix exhausted after {} attempt(s)", attempt)
        }
        FixState::Aborted { attempt, reason } => {
            format!("Auto-fix aborted on attempt {}: {}", attempt, reason)
        }
        other => format!("Auto-fix state: {:?}", other),
    }
}

fn fix_state_json(state: &FixState) -> serde_json::Value {
    match state {
        FixState::Success { attempt } => {
            serde_json::json!({ "state": "success", "attempt": attempt })
        }
        FixState::Exhausted { attempt } => {
            serde_json::json!({ "state": "exhausted", "attempt": attempt })
        }
        FixState::Aborted { attempt, reason } => {
            serde_json::json!({ "state": "aborted", "attempt": attempt, "reason": reason })
        }
        FixState::Idle => serde_json::json!({ "state": "idle" }),
        FixState::Analyzing { attempt } => {
            serde_json::json!({ "state": "analyzing", "attempt": attempt })
        }
        FixState::Fixing { attempt } => {
            serde_json::json!({ "state": "fixing", "attempt": attempt })
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
