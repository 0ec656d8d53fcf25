//! Provider abstraction: one canonical request/response/stream shape,
//! translated to heterogeneous upstream protocols.
//!
//! The gateway speaks the OpenAI chat-completion format internally. Each
//! adapter implements [`Provider`] and owns its own wire translation, so the
//! orchestrator (and the client) cannot tell which provider answered.

mod openai;
pub use openai::OpenAiProvider;

#[cfg(feature = "bedrock")]
mod bedrock;
#[cfg(feature = "bedrock")]
pub use bedrock::BedrockProvider;

use async_trait::async_trait;
use futures_util::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::clients::ClientConfig;
use crate::config::Settings;
use crate::error::GatewayError;

/// Which upstream a client routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Openai,
    Bedrock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Openai => f.write_str("openai"),
            ProviderKind::Bedrock => f.write_str("bedrock"),
        }
    }
}

/// One message in a chat-completion request. Unknown fields ride along in
/// `extra` so the upstream sees exactly what the client sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A chat-completion request in the OpenAI wire shape. Parameters the
/// gateway does not interpret (temperature, max_tokens, ...) are preserved
/// opaquely in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ChatRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Combined user-provided text: the content of `user` and `tool`
    /// messages. System and assistant turns are the operator's and the
    /// model's own words, not untrusted input.
    pub fn user_text(&self) -> String {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == "user" || m.role == "tool")
            .map(|m| m.content.as_str())
            .collect();
        parts.join("\n")
    }

}

/// Non-streaming upstream reply: status plus the translated body.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: Value,
}

/// One streaming event as it goes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    /// Raw SSE payload (a JSON object, or the literal `[DONE]`).
    pub data: String,
    /// True only for the terminal sentinel.
    pub is_done: bool,
    /// Text extracted from this chunk, for response-scan accumulation.
    pub text_delta: String,
}

impl StreamChunk {
    pub fn data(data: String, text_delta: String) -> Self {
        Self {
            data,
            is_done: false,
            text_delta,
        }
    }

    pub fn done() -> Self {
        Self {
            data: "[DONE]".to_string(),
            is_done: true,
            text_delta: String::new(),
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GatewayError>> + Send>>;

/// Contract every upstream adapter satisfies.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Send a buffered chat completion and return the translated reply.
    async fn complete(
        &self,
        request: &ChatRequest,
        client: &ClientConfig,
    ) -> Result<ProviderResponse, GatewayError>;

    /// Open a streaming chat completion. The stream ends with exactly one
    /// terminal sentinel chunk.
    async fn stream(
        &self,
        request: &ChatRequest,
        client: &ClientConfig,
    ) -> Result<ChunkStream, GatewayError>;
}

/// Registry of provider singletons keyed by [`ProviderKind`].
///
/// The OpenAI adapter is built eagerly (it is the common path and needs no
/// external setup). Bedrock is created on first use so the cloud SDK never
/// initializes in deployments that do not route to it.
pub struct ProviderRegistry {
    openai: Arc<OpenAiProvider>,
    #[cfg(feature = "bedrock")]
    bedrock: tokio::sync::OnceCell<Arc<BedrockProvider>>,
    #[cfg(feature = "bedrock")]
    aws_region: String,
}

impl ProviderRegistry {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let openai = Arc::new(OpenAiProvider::new(
            &settings.upstream_base_url,
            SecretString::new(settings.upstream_api_key.clone().into()),
            Duration::from_secs(settings.upstream_timeout_secs),
        )?);
        Ok(Self {
            openai,
            #[cfg(feature = "bedrock")]
            bedrock: tokio::sync::OnceCell::new(),
            #[cfg(feature = "bedrock")]
            aws_region: settings.aws_region.clone(),
        })
    }

    pub async fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>, GatewayError> {
        match kind {
            ProviderKind::Openai => Ok(self.openai.clone()),
            #[cfg(feature = "bedrock")]
            ProviderKind::Bedrock => {
                let provider = self
                    .bedrock
                    .get_or_init(|| async {
                        Arc::new(BedrockProvider::connect(&self.aws_region).await)
                    })
                    .await;
                Ok(provider.clone())
            }
            #[cfg(not(feature = "bedrock"))]
            ProviderKind::Bedrock => Err(GatewayError::Internal(anyhow::anyhow!(
                "bedrock support not compiled in"
            ))),
        }
    }
}

/// Concatenated assistant text from a buffered response body, for the
/// response-side scan.
pub fn assistant_text(body: &Value) -> String {
    let Some(choices) = body.get("choices").and_then(Value::as_array) else {
        return String::new();
    };
    let parts: Vec<&str> = choices
        .iter()
        .filter_map(|c| c.get("message"))
        .filter_map(|m| m.get("content"))
        .filter_map(Value::as_str)
        .collect();
    parts.join("\n")
}
