use crate::sandbox::ExecutionResult;

/// Fill the repair prompt template with the failure details. The template's
/// `{errors}` placeholder receives the language, captured output and exit
/// code of the failed run.
pub fn render_repair_prompt(template: &str, failure: &ExecutionResult) -> String {
    let errors = format!(
        "Language: {}\nError Output:\n{}\nExit Code: {}",
        failure.language, failure.output, failure.exit_code
    );
    template.replace("{errors}", &errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::DEFAULT_FIX_PROMPT;

    fn failure() -> ExecutionResult {
        ExecutionResult {
            language: "python".to_string(),
            output: "NameError: name 'x' is not defined".to_string(),
            exit_code: 1,
            duration_secs: 0.2,
            peak_cpu_percent: 0.0,
            peak_memory_bytes: 0,
            artifacts: Vec::new(),
            container_id: None,
            timed_out: false,
        }
    }

    #[test]
    fn test_placeholder_is_replaced() {
        let prompt = render_repair_prompt(DEFAULT_FIX_PROMPT, &failure());
        assert!(!prompt.contains("{errors}"));
        assert!(prompt.contains("Language: python"));
        assert!(prompt.contains("NameError: name 'x' is not defined"));
        assert!(prompt.contains("Exit Code: 1"));
    }

    #[test]
    fn test_template_without_placeholder_passes_through() {
        let prompt = render_repair_prompt("Fix it.", &failure());
        assert_eq!(prompt, "Fix it.");
    }
}
