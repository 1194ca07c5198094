use crate::ai_sdk::{
    contents_from_messages, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
};
use crate::protocol::Message;
use crate::tools::provider_tools;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 500;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("request to provider failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed provider chunk: {0}")]
    Decode(#[from] serde_json::Error),
}

pub(crate) type ChunkStream = BoxStream<'static, Result<GenerateContentResponse, AgentError>>;

/// A streaming chat-completion backend.
#[async_trait]
pub(crate) trait ChatProvider: Send + Sync {
    /// Starts a completion for `messages`, where the last message is the new
    /// user turn. Errors here mean nothing has been streamed yet.
    async fn stream_chat(&self, messages: &[Message]) -> Result<ChunkStream, AgentError>;
}

pub struct AgentConfig {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

pub struct Agent {
    client: Client,
    api_key: String,
    model: String,
    api_base: String,
    max_output_tokens: u32,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            api_key: config.api_key,
            model: config.model,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.api_base, self.model
        )
    }
}

#[async_trait]
impl ChatProvider for Agent {
    async fn stream_chat(&self, messages: &[Message]) -> Result<ChunkStream, AgentError> {
        let request = GenerateContentRequest {
            contents: contents_from_messages(messages),
            tools: provider_tools(),
            generation_config: GenerationConfig {
                max_output_tokens: self.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Api { status, body });
        }

        Ok(sse_chunks(response.bytes_stream()))
    }
}

/// Splits a server-sent-events body into the payloads of its `data:` fields.
#[derive(Default)]
struct SseBuffer {
    buffer: Vec<u8>,
}

impl SseBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut payloads = Vec::new();
        while let Some(idx) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw_event = String::from_utf8_lossy(&self.buffer[..idx]).into_owned();
            self.buffer.drain(..idx + 2);

            if let Some(data) = extract_sse_data(&raw_event) {
                payloads.push(data);
            }
        }
        payloads
    }

    fn finish(&mut self) -> Option<String> {
        let raw_event = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
        extract_sse_data(&raw_event)
    }
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn sse_chunks<S>(body: S) -> ChunkStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = (
        Box::pin(body),
        SseBuffer::default(),
        VecDeque::<String>::new(),
        false,
    );

    stream::unfold(
        state,
        |(mut body, mut buffer, mut pending, mut done)| async move {
            loop {
                if let Some(data) = pending.pop_front() {
                    let chunk = serde_json::from_str::<GenerateContentResponse>(&data)
                        .map_err(AgentError::from);
                    return Some((chunk, (body, buffer, pending, done)));
                }
                if done {
                    return None;
                }

                match body.next().await {
                    Some(Ok(bytes)) => pending.extend(buffer.push(&bytes)),
                    Some(Err(err)) => {
                        pending.clear();
                        return Some((Err(err.into()), (body, buffer, pending, true)));
                    }
                    None => {
                        pending.extend(buffer.finish());
                        done = true;
                    }
                }
            }
        },
    )
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Sender;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn agent_for(server: &MockServer) -> Agent {
        Agent::new(AgentConfig {
            api_key: "test-key".to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_base: server.uri(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn sse_body(chunks: &[serde_json::Value]) -> String {
        chunks
            .iter()
            .map(|chunk| format!("data: {}\r\n\r\n", chunk))
            .collect()
    }

    #[test]
    fn sse_buffer_reassembles_split_events() {
        let mut buffer = SseBuffer::default();
        assert!(buffer.push(b"data: {\"a\":").is_empty());
        assert_eq!(buffer.push(b"1}\r\n\r\ndata: {\"b\":2}\r\n"), vec!["{\"a\":1}"]);
        assert_eq!(buffer.push(b"\r\n"), vec!["{\"b\":2}"]);
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn sse_buffer_flushes_unterminated_event() {
        let mut buffer = SseBuffer::default();
        assert!(buffer.push(b"data: {}").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn stream_chat_posts_history_and_tools() {
        let server = MockServer::start().await;
        let body = sse_body(&[
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "Hel"}]}}]}),
            json!({"candidates": [{"content": {"role": "model", "parts": [{"text": "lo"}]}}]}),
        ]);

        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-1.5-flash:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(header("x-goog-api-key", "test-key"))
            .and(body_partial_json(json!({
                "contents": [
                    {"role": "user", "parts": [{"text": "hi"}]},
                    {"role": "model", "parts": [{"text": "hey"}]},
                    {"role": "user", "parts": [{"text": "say hello"}]}
                ],
                "generationConfig": {"maxOutputTokens": 500}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let messages = vec![
            Message::new(0, Sender::User, "hi"),
            Message::new(1, Sender::Ai, "hey"),
            Message::new(2, Sender::User, "say hello"),
        ];

        let chunks: Vec<_> = agent_for(&server)
            .stream_chat(&messages)
            .await
            .unwrap()
            .collect()
            .await;

        let texts: Vec<_> = chunks
            .iter()
            .map(|chunk| chunk.as_ref().unwrap().text().unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn stream_chat_surfaces_api_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .mount(&server)
            .await;

        let result = agent_for(&server)
            .stream_chat(&[Message::new(0, Sender::User, "hi")])
            .await;

        match result {
            Err(AgentError::Api { status, body }) => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "API key not valid");
            }
            Err(other) => panic!("expected API error, got {}", other),
            Ok(_) => panic!("expected API error"),
        }
    }

    #[tokio::test]
    async fn malformed_chunk_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {not json\r\n\r\n"),
            )
            .mount(&server)
            .await;

        let mut chunks = agent_for(&server)
            .stream_chat(&[Message::new(0, Sender::User, "hi")])
            .await
            .unwrap();

        assert!(matches!(chunks.next().await, Some(Err(AgentError::Decode(_)))));
        assert!(chunks.next().await.is_none());
    }
}
