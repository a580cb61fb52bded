use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunletConfig {
    pub sandbox: SandboxPolicy,
    pub autofix: AutoFixPolicy,
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for RunletConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxPolicy::default(),
            autofix: AutoFixPolicy::default(),
            providers: default_providers(),
        }
    }
}

/// Resource quota and runtime settings for session containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Docker image the sandbox containers run
    pub image: String,
    /// Automatically build the image from docker/Dockerfile.sandbox if missing
    pub build_image: bool,
    /// CPU cores allotted to each container
    pub cpu_cores: f64,
    /// Memory ceiling in MB
    pub memory_limit_mb: u64,
    /// Wall-clock timeout per execution, in seconds (0 disables the wrapper)
    pub timeout_seconds: u64,
    /// Working directory inside the container
    pub workdir: String,
    /// Allow network access from the container
    pub enable_networking: bool,
    /// Resource sampling interval during a run, in milliseconds
    pub sample_interval_ms: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            image: "runlet-sandbox:latest".to_string(),
            build_image: true,
            cpu_cores: 2.0,
            memory_limit_mb: 8192,
            timeout_seconds: 30,
            workdir: "/workspace".to_string(),
            enable_networking: true,
            sample_interval_ms: 500,
        }
    }
}

pub const DEFAULT_FIX_PROMPT: &str = "The code execution failed with the following error(s):\n\n\
{errors}\n\n\
Please provide ONLY the fixed code in code blocks. Do not include any explanations, \
commentary, or text outside of code blocks. Just the working code.";

/// Settings for the auto-remediation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoFixPolicy {
    pub enabled: bool,
    /// Upper bound on generate-fix-execute cycles
    pub max_attempts: u32,
    /// Repair prompt template; `{errors}` is replaced with the failure details
    pub prompt_template: String,
    /// When true, every block of a replacement batch must exit zero; by
    /// default only the last block's exit status decides
    pub all_blocks_must_pass: bool,
}

impl Default for AutoFixPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            prompt_template: DEFAULT_FIX_PROMPT.to_string(),
            all_blocks_must_pass: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub default_model: String,
    pub base_url: Option<String>,
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    HashMap::from([
        (
            "anthropic".to_string(),
            ProviderConfig {
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                default_model: "claude-sonnet-4-20250514".to_string(),
                base_url: None,
            },
        ),
        (
            "openai".to_string(),
            ProviderConfig {
                api_key_env: "OPENAI_API_KEY".to_string(),
                default_model: "gpt-4o".to_string(),
                base_url: None,
            },
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunletConfig::default();
        assert_eq!(config.sandbox.timeout_seconds, 30);
        assert_eq!(config.sandbox.cpu_cores, 2.0);
        assert_eq!(config.autofix.max_attempts, 10);
        assert!(config.autofix.prompt_template.contains("{errors}"));
        assert!(config.providers.contains_key("anthropic"));
        assert!(config.providers.contains_key("openai"));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml = r#"
            [sandbox]
            timeout_seconds = 5
            memory_limit_mb = 512
        "#;
        let config: RunletConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.sandbox.timeout_seconds, 5);
        assert_eq!(config.sandbox.memory_limit_mb, 512);
        assert_eq!(config.sandbox.image, "runlet-sandbox:latest");
        assert_eq!(config.autofix.max_attempts, 10);
    }
}
