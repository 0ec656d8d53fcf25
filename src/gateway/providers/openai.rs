//! OpenAI-compatible HTTP adapter.
//!
//! Forwards request bodies nearly verbatim to `{base}/v1/chat/completions`
//! with a bearer credential. Streaming parses server-sent-event line framing
//! incrementally; lines may span chunk boundaries, so a byte buffer carries
//! partial lines between reads.

use async_trait::async_trait;
use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{ChatRequest, ChunkStream, Provider, ProviderResponse, StreamChunk};
use crate::clients::ClientConfig;
use crate::error::GatewayError;

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    default_credential: SecretString,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        base_url: &str,
        default_credential: SecretString,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_credential,
            timeout,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    /// Per-client credential with fallback to the global one.
    fn credential<'a>(&'a self, client: &'a ClientConfig) -> &'a SecretString {
        if client.upstream_credential.expose_secret().is_empty() {
            &self.default_credential
        } else {
            &client.upstream_credential
        }
    }
}

fn map_send_error(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::UpstreamTimeout
    } else if e.is_connect() {
        GatewayError::Upstream(format!("cannot reach upstream: {e}"))
    } else {
        GatewayError::Upstream(e.to_string())
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        request: &ChatRequest,
        client: &ClientConfig,
    ) -> Result<ProviderResponse, GatewayError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.credential(client).expose_secret())
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream(format!(
                "upstream returned {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("invalid JSON from upstream: {e}")))?;
        Ok(ProviderResponse {
            status: status.as_u16(),
            body,
        })
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        client: &ClientConfig,
    ) -> Result<ChunkStream, GatewayError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(self.credential(client).expose_secret())
            .json(request)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream(format!(
                "upstream returned {status}"
            )));
        }

        debug!(status = %status, "upstream stream open");

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            while let Some(item) = bytes.next().await {
                match item {
                    Ok(buf) => {
                        for chunk in parser.push(&buf) {
                            let done = chunk.is_done;
                            yield Ok(chunk);
                            if done {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(GatewayError::Upstream(format!("upstream stream failed: {e}")));
                        return;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Incremental SSE line parser. Feeds on raw body chunks and emits one
/// [`StreamChunk`] per complete `data:` line.
struct SseParser {
    buf: Vec<u8>,
    done: bool,
}

impl SseParser {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            done: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            // Skip blank separators and event-type lines
            let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
            else {
                continue;
            };
            let payload = payload.trim_start();

            if payload == "[DONE]" {
                self.done = true;
                out.push(StreamChunk::done());
                return out;
            }

            out.push(StreamChunk::data(payload.to_string(), delta_text(payload)));
        }
        out
    }
}

/// Text delta carried by one chunk payload. Non-JSON payloads are forwarded
/// untouched with no extracted text.
fn delta_text(payload: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return String::new();
    };
    value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSE_FIXTURE: &str = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    #[test]
    fn parses_complete_sse_stream() {
        let mut parser = SseParser::new();
        let chunks = parser.push(SSE_FIXTURE.as_bytes());

        assert_eq!(chunks.len(), 5);
        assert!(chunks[4].is_done);
        assert_eq!(chunks[4].data, "[DONE]");

        let text: String = chunks.iter().map(|c| c.text_delta.as_str()).collect();
        assert_eq!(text, "Hello world");
    }

    #[test]
    fn handles_lines_split_across_chunks() {
        // Feed 7 bytes at a time so data lines straddle chunk boundaries
        let mut parser = SseParser::new();
        let mut chunks = Vec::new();
        for piece in SSE_FIXTURE.as_bytes().chunks(7) {
            chunks.extend(parser.push(piece));
        }

        assert_eq!(chunks.len(), 5);
        let text: String = chunks.iter().map(|c| c.text_delta.as_str()).collect();
        assert_eq!(text, "Hello world");
        assert!(chunks.last().unwrap().is_done);
    }

    #[test]
    fn ignores_event_lines_and_blanks() {
        let mut parser = SseParser::new();
        let chunks = parser.push(b"event: ping\n\ndata: [DONE]\n\n");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_done);
    }

    #[test]
    fn stops_after_terminal_sentinel() {
        let mut parser = SseParser::new();
        let first = parser.push(b"data: [DONE]\n\n");
        assert_eq!(first.len(), 1);
        let after = parser.push(b"data: {\"stray\":true}\n\n");
        assert!(after.is_empty());
    }

    #[test]
    fn non_json_payload_forwarded_without_delta() {
        let mut parser = SseParser::new();
        let chunks = parser.push(b"data: not-json\n\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, "not-json");
        assert_eq!(chunks[0].text_delta, "");
    }
}
