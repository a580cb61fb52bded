use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while an execution or auto-fix loop is in flight.
///
/// Within one session, events arrive at the sink in exactly the order they
/// were produced. The tagged serialization matches the wire format consumed
/// by UI clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Informational message about engine activity
    Feedback { message: String, level: Level },
    /// Truncated preview of the code about to run
    CodePreview { language: String, content: String },
    ExecutionStart { language: String },
    ExecutionEnd { exit_code: i64, duration_secs: f64 },
    /// Auto-fix loop entered a new phase for the given attempt
    AutoFix {
        status: FixPhase,
        attempt: u32,
        max_attempts: u32,
    },
    /// The repair prompt that was appended to the conversation
    AutoFixPrompt { content: String, attempt: u32 },
    /// Last execution of the batch failed; another attempt follows
    AutoFixRetry { attempt: u32, max_attempts: u32 },
    /// Terminal event for the auto-fix loop
    AutoFixComplete {
        success: bool,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixPhase {
    Analyzing,
    Fixing,
}

/// Channel end that execution pushes events into, in real time.
pub type EventSink = mpsc::UnboundedSender<ProgressEvent>;

pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<ProgressEvent>) {
    mpsc::unbounded_channel()
}

/// Send an event, ignoring a dropped receiver. A caller that stopped
/// listening must not abort the run itself.
pub fn emit(sink: &EventSink, event: ProgressEvent) {
    let _ = sink.send(event);
}

pub fn feedback(sink: &EventSink, level: Level, message: impl Into<String>) {
    emit(
        sink,
        ProgressEvent::Feedback {
            message: message.into(),
            level,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tags() {
        let ev = ProgressEvent::ExecutionEnd {
            exit_code: 0,
            duration_secs: 1.5,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "execution_end");
        assert_eq!(json["exit_code"], 0);

        let ev = ProgressEvent::AutoFix {
            status: FixPhase::Analyzing,
            attempt: 1,
            max_attempts: 10,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "auto_fix");
        assert_eq!(json["status"], "analyzing");
    }

    #[test]
    fn test_complete_event_omits_empty_reason() {
        let ev = ProgressEvent::AutoFixComplete {
            success: true,
            attempt: 2,
            reason: None,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("reason").is_none());
    }

    #[tokio::test]
    async fn test_events_delivered_in_emission_order() {
        let (sink, mut rx) = channel();
        feedback(&sink, Level::Info, "first");
        emit(
            &sink,
            ProgressEvent::ExecutionStart {
                language: "python".into(),
            },
        );
        feedback(&sink, Level::Success, "last");
        drop(sink);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev);
        }
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0], ProgressEvent::Feedback { .. }));
        assert!(matches!(seen[1], ProgressEvent::ExecutionStart { .. }));
        assert!(matches!(
            seen[2],
            ProgressEvent::Feedback {
                level: Level::Success,
                ..
            }
        ));
    }

    #[test]
    fn test_emit_tolerates_dropped_receiver() {
        let (sink, rx) = channel();
        drop(rx);
        feedback(&sink, Level::Info, "nobody listening");
    }
}
