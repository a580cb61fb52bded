use std::sync::Arc;

use crate::config::types::RunletConfig;
use crate::error::{Result, RunletError};
use crate::providers::anthropic::AnthropicProvider;
use crate::providers::openai::OpenAiProvider;
use crate::providers::traits::AiProvider;

pub fn create_provider(
    name: &str,
    model: Option<&str>,
    config: &RunletConfig,
) -> Result<Arc<dyn AiProvider>> {
    let provider_config =
        config
            .providers
            .get(name)
            .ok_or_else(|| RunletError::ProviderNotFound {
                provider: name.to_string(),
            })?;

    let api_key =
        std::env::var(&provider_config.api_key_env).map_err(|_| RunletError::ApiKeyMissing {
            provider: name.to_string(),
            env_var: provider_config.api_key_env.clone(),
        })?;

    let model = model
        .map(String::from)
        .unwrap_or_else(|| provider_config.default_model.clone());

    let provider: Arc<dyn AiProvider> = match name {
        "anthropic" => Arc::new(AnthropicProvider::new(
            api_key,
            model,
            provider_config.base_url.clone(),
        )),
        "openai" => Arc::new(OpenAiProvider::new(
            api_key,
            model,
            provider_config.base_url.clone(),
        )),
        _ => {
            return Err(RunletError::ProviderNotFound {
                provider: name.to_string(),
            });
        }
    };

    Ok(provider)
}
