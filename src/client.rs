use crate::protocol::{ChatRequest, ErrorResponse, Message};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client as HttpClient, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to relay failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay returned {status}: {message}")]
    Status { status: StatusCode, message: String },
}

pub type ByteStream = BoxStream<'static, Result<Bytes, ClientError>>;

#[derive(Clone)]
pub struct RelayClient {
    base_url: String,
    http: HttpClient,
}

impl RelayClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base_url(base_url),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts the conversation and returns the raw event-stream body.
    pub async fn open_stream(&self, messages: &[Message]) -> Result<ByteStream, ClientError> {
        let request = ChatRequest {
            messages: Some(messages.to_vec()),
        };
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|err| err.error)
                .unwrap_or(body);
            return Err(ClientError::Status { status, message });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ClientError::from))
            .boxed())
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
