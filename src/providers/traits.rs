use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One turn of the running conversation. The caller owns the history; the
/// auto-fix loop only appends to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Provider name identifier
    fn name(&self) -> &str;

    /// Send the conversation and return the full completion text
    async fn complete(&self, messages: &[Message], system_prompt: Option<&str>) -> Result<String>;
}
