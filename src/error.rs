use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Provider errors
    #[error("Provider '{provider}' not found")]
    ProviderNotFound { provider: String },

    #[error("API key not found for provider '{provider}' (expected env: {env_var})")]
    ApiKeyMissing { provider: String, env_var: String },

    #[error("Provider API error: {message}")]
    ProviderApi {
        message: String,
        status: Option<u16>,
    },

    #[error("Rate limited by provider, retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    // Sandbox errors
    #[error("Docker is not available: {0}")]
    DockerUnavailable(String),

    #[error("Container creation failed: {0}")]
    ContainerCreate(String),

    #[error("Command execution failed in container: {0}")]
    ContainerExec(String),

    #[error("Unsupported language: {language}")]
    UnsupportedLanguage { language: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RunletError>;
