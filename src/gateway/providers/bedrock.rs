//! AWS Bedrock Converse adapter.
//!
//! Translates the canonical OpenAI chat shape into Converse calls and back:
//! system messages become the `system` parameter, conversation turns become
//! role + content-block messages, and responses are rebuilt in the OpenAI
//! shape so callers cannot tell which provider answered. Authentication is
//! ambient cloud identity; per-client upstream credentials are ignored.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::config::Region;
use aws_sdk_bedrockruntime::error::SdkError;
use aws_sdk_bedrockruntime::operation::converse::ConverseError;
use aws_sdk_bedrockruntime::operation::converse_stream::ConverseStreamError;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, ConverseStreamOutput as StreamEvent, InferenceConfiguration,
    Message, StopReason, SystemContentBlock,
};
use http::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use super::{ChatRequest, ChunkStream, Provider, ProviderResponse, StreamChunk};
use crate::clients::ClientConfig;
use crate::error::GatewayError;

pub struct BedrockProvider {
    client: aws_sdk_bedrockruntime::Client,
}

impl BedrockProvider {
    /// Load ambient AWS configuration and build the runtime client.
    pub async fn connect(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_bedrockruntime::Client::new(&config),
        }
    }

    fn model_id(client: &ClientConfig) -> Result<&str, GatewayError> {
        client
            .bedrock_model_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                GatewayError::InvalidRequest(
                    "bedrock_model_id is required for the bedrock provider".to_string(),
                )
            })
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    async fn complete(
        &self,
        request: &ChatRequest,
        client: &ClientConfig,
    ) -> Result<ProviderResponse, GatewayError> {
        let model_id = Self::model_id(client)?;

        let output = self
            .client
            .converse()
            .model_id(model_id)
            .set_system(non_empty(system_blocks(request)))
            .set_messages(Some(conversation_messages(request)?))
            .set_inference_config(inference_config(request))
            .send()
            .await
            .map_err(map_converse_error)?;

        let text = output
            .output()
            .and_then(|o| o.as_message().ok())
            .map(|message| {
                message
                    .content()
                    .iter()
                    .filter_map(|block| block.as_text().ok())
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let (input_tokens, output_tokens) = output
            .usage()
            .map(|u| (u.input_tokens(), u.output_tokens()))
            .unwrap_or((0, 0));

        let body = response_body(
            model_id,
            &text,
            finish_reason(output.stop_reason()),
            input_tokens,
            output_tokens,
        );
        Ok(ProviderResponse { status: 200, body })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        client: &ClientConfig,
    ) -> Result<ChunkStream, GatewayError> {
        let model_id = Self::model_id(client)?.to_string();

        let output = self
            .client
            .converse_stream()
            .model_id(&model_id)
            .set_system(non_empty(system_blocks(request)))
            .set_messages(Some(conversation_messages(request)?))
            .set_inference_config(inference_config(request))
            .send()
            .await
            .map_err(map_converse_stream_error)?;

        debug!(model = %model_id, "bedrock stream open");

        let chunk_id = format!("bedrock-{}", chrono::Utc::now().timestamp());
        let mut events = output.stream;
        let stream = async_stream::stream! {
            loop {
                match events.recv().await {
                    Ok(Some(StreamEvent::ContentBlockDelta(event))) => {
                        let delta = event
                            .delta()
                            .and_then(|d| d.as_text().ok())
                            .cloned()
                            .unwrap_or_default();
                        let data = delta_chunk(&chunk_id, &model_id, &delta);
                        yield Ok(StreamChunk::data(data.to_string(), delta));
                    }
                    Ok(Some(StreamEvent::MessageStop(event))) => {
                        let data = finish_chunk(
                            &chunk_id,
                            &model_id,
                            finish_reason(event.stop_reason()),
                        );
                        yield Ok(StreamChunk::data(data.to_string(), String::new()));
                        yield Ok(StreamChunk::done());
                        return;
                    }
                    // Block boundaries, message start, and metadata carry no
                    // client-visible text
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        yield Ok(StreamChunk::done());
                        return;
                    }
                    Err(e) => {
                        yield Err(GatewayError::Upstream(format!("bedrock stream failed: {e}")));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// System turns become the Converse `system` parameter.
fn system_blocks(request: &ChatRequest) -> Vec<SystemContentBlock> {
    request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| SystemContentBlock::Text(m.content.clone()))
        .collect()
}

/// Non-system turns become Converse messages. Bedrock knows only user and
/// assistant roles, so tool output is presented as user input.
fn conversation_messages(request: &ChatRequest) -> Result<Vec<Message>, GatewayError> {
    request
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            let role = if m.role == "assistant" {
                ConversationRole::Assistant
            } else {
                ConversationRole::User
            };
            Message::builder()
                .role(role)
                .content(ContentBlock::Text(m.content.clone()))
                .build()
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!("message build failed: {e}")))
        })
        .collect()
}

/// Map the opaque OpenAI sampling parameters onto Converse inference config.
fn inference_config(request: &ChatRequest) -> Option<InferenceConfiguration> {
    let mut builder = InferenceConfiguration::builder();
    let mut any = false;

    if let Some(temperature) = request.extra.get("temperature").and_then(Value::as_f64) {
        builder = builder.temperature(temperature as f32);
        any = true;
    }
    if let Some(max_tokens) = request.extra.get("max_tokens").and_then(Value::as_i64) {
        builder = builder.max_tokens(max_tokens as i32);
        any = true;
    }
    if let Some(top_p) = request.extra.get("top_p").and_then(Value::as_f64) {
        builder = builder.top_p(top_p as f32);
        any = true;
    }
    if let Some(stop) = request.extra.get("stop") {
        let sequences: Vec<String> = match stop {
            Value::String(s) => vec![s.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        if !sequences.is_empty() {
            builder = builder.set_stop_sequences(Some(sequences));
            any = true;
        }
    }

    any.then(|| builder.build())
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn finish_reason(stop_reason: &StopReason) -> &'static str {
    match stop_reason {
        StopReason::MaxTokens => "length",
        _ => "stop",
    }
}

/// Rebuild a Converse reply in the OpenAI chat-completion shape.
fn response_body(
    model_id: &str,
    text: &str,
    finish_reason: &str,
    input_tokens: i32,
    output_tokens: i32,
) -> Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "id": format!("bedrock-{now}"),
        "object": "chat.completion",
        "created": now,
        "model": model_id,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    })
}

fn delta_chunk(chunk_id: &str, model_id: &str, delta: &str) -> Value {
    json!({
        "id": chunk_id,
        "object": "chat.completion.chunk",
        "model": model_id,
        "choices": [{
            "index": 0,
            "delta": {"content": delta},
            "finish_reason": null,
        }],
    })
}

fn finish_chunk(chunk_id: &str, model_id: &str, finish_reason: &str) -> Value {
    json!({
        "id": chunk_id,
        "object": "chat.completion.chunk",
        "model": model_id,
        "choices": [{
            "index": 0,
            "delta": {},
            "finish_reason": finish_reason,
        }],
    })
}

/// Transport-level failures (timeouts, connection errors) are mapped before
/// unwrapping the service error.
fn map_converse_error(e: SdkError<ConverseError>) -> GatewayError {
    match &e {
        SdkError::TimeoutError(_) => GatewayError::UpstreamTimeout,
        SdkError::DispatchFailure(_) => {
            GatewayError::Upstream(format!("cannot reach bedrock: {e}"))
        }
        _ => map_service_error(e.into_service_error()),
    }
}

fn map_converse_stream_error(e: SdkError<ConverseStreamError>) -> GatewayError {
    match &e {
        SdkError::TimeoutError(_) => GatewayError::UpstreamTimeout,
        SdkError::DispatchFailure(_) => {
            GatewayError::Upstream(format!("cannot reach bedrock: {e}"))
        }
        _ => map_stream_service_error(e.into_service_error()),
    }
}

fn map_service_error(e: ConverseError) -> GatewayError {
    if e.is_throttling_exception() {
        GatewayError::UpstreamRejected {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "bedrock rate limit exceeded".to_string(),
        }
    } else if e.is_validation_exception() {
        GatewayError::UpstreamRejected {
            status: StatusCode::BAD_REQUEST,
            message: format!("bedrock validation error: {e}"),
        }
    } else if e.is_access_denied_exception() {
        GatewayError::UpstreamRejected {
            status: StatusCode::FORBIDDEN,
            message: "bedrock access denied, check IAM permissions".to_string(),
        }
    } else if e.is_model_not_ready_exception() {
        GatewayError::UpstreamRejected {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "bedrock model not ready".to_string(),
        }
    } else if e.is_model_timeout_exception() {
        GatewayError::UpstreamTimeout
    } else {
        GatewayError::Upstream(format!("bedrock error: {e}"))
    }
}

fn map_stream_service_error(e: ConverseStreamError) -> GatewayError {
    if e.is_throttling_exception() {
        GatewayError::UpstreamRejected {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "bedrock rate limit exceeded".to_string(),
        }
    } else if e.is_validation_exception() {
        GatewayError::UpstreamRejected {
            status: StatusCode::BAD_REQUEST,
            message: format!("bedrock validation error: {e}"),
        }
    } else if e.is_access_denied_exception() {
        GatewayError::UpstreamRejected {
            status: StatusCode::FORBIDDEN,
            message: "bedrock access denied, check IAM permissions".to_string(),
        }
    } else if e.is_model_timeout_exception() {
        GatewayError::UpstreamTimeout
    } else {
        GatewayError::Upstream(format!("bedrock error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_messages_become_system_parameter() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "Be terse."},
                {"role": "user", "content": "hi"}
            ]
        }));
        let system = system_blocks(&req);
        assert_eq!(system.len(), 1);
        assert!(matches!(&system[0], SystemContentBlock::Text(t) if t == "Be terse."));

        let messages = conversation_messages(&req).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role(), &ConversationRole::User);
    }

    #[test]
    fn tool_turns_are_presented_as_user_input() {
        let req = request(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": "calling tool"},
                {"role": "tool", "content": "tool says 42"}
            ]
        }));
        let messages = conversation_messages(&req).unwrap();
        assert_eq!(messages[0].role(), &ConversationRole::Assistant);
        assert_eq!(messages[1].role(), &ConversationRole::User);
    }

    #[test]
    fn inference_config_maps_sampling_parameters() {
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.5,
            "max_tokens": 256,
            "top_p": 0.9,
            "stop": ["END"]
        }));
        let config = inference_config(&req).unwrap();
        assert_eq!(config.temperature(), Some(0.5));
        assert_eq!(config.max_tokens(), Some(256));
        assert_eq!(config.top_p(), Some(0.9));
        assert_eq!(config.stop_sequences(), ["END".to_string()]);
    }

    #[test]
    fn inference_config_absent_when_no_parameters() {
        let req = request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(inference_config(&req).is_none());
    }

    #[test]
    fn response_body_is_openai_shaped() {
        let body = response_body("anthropic.claude-3", "Hello!", "stop", 10, 4);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "anthropic.claude-3");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 14);
    }

    #[test]
    fn max_tokens_stop_maps_to_length() {
        assert_eq!(finish_reason(&StopReason::MaxTokens), "length");
        assert_eq!(finish_reason(&StopReason::EndTurn), "stop");
    }

    #[test]
    fn missing_model_id_is_rejected() {
        use crate::clients::{ClientConfig, ClientStatus};
        use crate::gateway::providers::ProviderKind;
        use secrecy::SecretString;

        let client = ClientConfig {
            client_id: "c".into(),
            api_key: "k".into(),
            provider: ProviderKind::Bedrock,
            rate_limit_rpm: 60,
            allowed_models: Vec::new(),
            upstream_credential: SecretString::new("".into()),
            bedrock_model_id: None,
            status: ClientStatus::Active,
        };
        let err = BedrockProvider::model_id(&client).unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
}
