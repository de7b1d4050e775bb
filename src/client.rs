use crate::auth::{SESSION_HEADER, TOKEN_HEADER};
use crate::messages::ChatMessage;
use crate::relay::Frame;
use crate::store::StoreError;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::pin::Pin;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("gateway rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("no API key configured for provider {0}")]
    MissingApiKey(String),
    #[error("malformed stream: {0}")]
    Protocol(String),
    #[error("{0}")]
    Generation(String),
    #[error("an exchange is already in progress")]
    Busy,
    #[error("message must not be empty")]
    EmptyMessage,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ClientError>> + Send>>;

/// Opens a generation stream against the gateway.
#[async_trait]
pub trait ChatStream: Send + Sync {
    async fn open(&self, model: &str, history: &[ChatMessage]) -> Result<FrameStream, ClientError>;
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    base_url: String,
    http: reqwest::Client,
    api_keys: HashMap<String, String>,
    session_id: Option<String>,
    token: Option<String>,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http(base_url, reqwest::Client::new())
    }

    pub fn with_http(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            api_keys: HashMap::new(),
            session_id: None,
            token: None,
        }
    }

    /// Key sent as the bearer credential for models of `provider`.
    pub fn api_key(mut self, provider: &str, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider.to_string(), key.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn key_for(&self, model: &str) -> Result<&str, ClientError> {
        let provider = model.split_once('/').map(|(p, _)| p).unwrap_or(model);
        self.api_keys
            .get(provider)
            .map(String::as_str)
            .ok_or_else(|| ClientError::MissingApiKey(provider.to_string()))
    }

    fn identity_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(session_id) = &self.session_id {
            req = req.header(SESSION_HEADER, session_id);
        }
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token);
        }
        req
    }

    /// Usage against the caller's quota, as reported by the gateway.
    pub async fn usage(&self) -> Result<Value, ClientError> {
        let req = self.identity_headers(self.http.get(format!("{}/v1/usage", self.base_url)));
        let resp = req.send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ChatStream for GatewayClient {
    async fn open(&self, model: &str, history: &[ChatMessage]) -> Result<FrameStream, ClientError> {
        let key = self.key_for(model)?;
        let req = self
            .http
            .post(format!("{}/v1/chat", self.base_url))
            .bearer_auth(key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({ "model": model, "messages": history }));
        let resp = self.identity_headers(req).send().await?;
        let resp = check_status(resp).await?;
        Ok(decode_frames(resp.bytes_stream()))
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(text);
    Err(ClientError::Rejected {
        status: status.as_u16(),
        message,
    })
}

/// Turns an SSE byte stream into gateway frames. Blank data lines are
/// skipped.
pub fn decode_frames<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let frames = bytes.eventsource().filter_map(|item| async move {
        match item {
            Ok(ev) if ev.data.trim().is_empty() => None,
            Ok(ev) => Some(
                serde_json::from_str::<Frame>(&ev.data)
                    .map_err(|err| ClientError::Protocol(format!("{err}: {}", ev.data))),
            ),
            Err(err) => Some(Err(ClientError::Protocol(err.to_string()))),
        }
    });
    Box::pin(frames)
}
