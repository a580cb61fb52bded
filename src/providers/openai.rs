use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunletError};
use crate::providers::traits::{AiProvider, Message, Role};

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, base_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
        }
    }
}

#[async_trait]
impl AiProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, messages: &[Message], system_prompt: Option<&str>) -> Result<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        // System prompt goes first as its own message
        let mut api_messages = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system_prompt {
            api_messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        api_messages.extend(messages.iter().map(OpenAiMessage::from));

        let api_request = OpenAiRequest {
            model: self.model.clone(),
            messages: api_messages,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&api_request)
            .send()
            .await?;

        let status = response.status();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(RunletError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RunletError::ProviderApi {
                message: error_text,
                status: Some(status.as_u16()),
            });
        }

        let api_response: OpenAiResponse = response.json().await?;

        let text = api_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        Ok(text)
    }
}

// OpenAI API types

#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
}

#[derive(Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

impl From<&Message> for OpenAiMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        OpenAiMessage {
            role: role.to_string(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}
