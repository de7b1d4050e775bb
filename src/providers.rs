use crate::config::{GatewayConfig, ProviderEndpoints};
use crate::error::GatewayError;
use crate::messages::{ChatMessage, Role};
use crate::upstream::{self, UpstreamAuth, UpstreamCallError, UpstreamErrorKind, UpstreamRequest};
use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The closed set of upstream providers. Adding one means adding a variant
/// here; every match below then has to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
}

impl Provider {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google" => Some(Self::Google),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    /// Caller-visible text for any upstream failure. Never includes provider
    /// detail.
    pub fn failure_message(&self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI request failed",
            Self::Anthropic => "Anthropic request failed",
            Self::Google => "Google request failed",
        }
    }

    pub fn base_url<'a>(&self, endpoints: &'a ProviderEndpoints) -> &'a str {
        match self {
            Self::OpenAi => &endpoints.openai,
            Self::Anthropic => &endpoints.anthropic,
            Self::Google => &endpoints.google,
        }
    }

    /// Builds the streaming client for this provider. Fails only on inputs the
    /// HTTP layer cannot carry at all.
    pub fn client(
        &self,
        endpoints: &ProviderEndpoints,
        http: reqwest::Client,
        api_key: &str,
    ) -> Result<ProviderClient, GatewayError> {
        HeaderValue::from_str(api_key).map_err(|err| {
            GatewayError::internal(format!("invalid {} API key: {err}", self.as_str()))
        })?;
        let base_url = self.base_url(endpoints).trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(GatewayError::internal(format!(
                "invalid {} base URL: {base_url}",
                self.as_str()
            )));
        }
        Ok(ProviderClient {
            provider: *self,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }
}

/// A parsed `<provider>/<model>` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoute {
    pub provider: Provider,
    pub model_id: String,
    pub composite: String,
}

/// Splits on the first `/`. Everything right of it is passed through to the
/// provider untouched, so `openai/ft:org/x` selects model `ft:org/x`.
pub fn route(model: &str) -> Result<ModelRoute, GatewayError> {
    let model = model.trim();
    let Some((provider, model_id)) = model.split_once('/') else {
        return Err(GatewayError::Validation(format!(
            "model must be of the form <provider>/<model>, got {model:?}"
        )));
    };
    let provider = Provider::from_str(provider)
        .ok_or_else(|| GatewayError::UnsupportedProvider(provider.to_string()))?;
    if model_id.is_empty() {
        return Err(GatewayError::Validation(format!(
            "model must be of the form <provider>/<model>, got {model:?}"
        )));
    }
    Ok(ModelRoute {
        provider,
        model_id: model_id.to_string(),
        composite: model.to_string(),
    })
}

/// One decoded unit of an upstream event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Done,
    Skip,
}

#[derive(Clone)]
pub struct ProviderClient {
    provider: Provider,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn build_request(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        gateway: &GatewayConfig,
    ) -> UpstreamRequest {
        match self.provider {
            Provider::OpenAi => UpstreamRequest {
                url: upstream::join_url(&self.base_url, "/v1/chat/completions"),
                auth: UpstreamAuth::Bearer,
                extra_headers: &[],
                body: json!({
                    "model": model_id,
                    "messages": messages,
                    "temperature": gateway.temperature,
                    "stream": true,
                }),
            },
            Provider::Anthropic => {
                let system = join_system(messages);
                let turns: Vec<Value> = messages
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                    .collect();
                let mut body = json!({
                    "model": model_id,
                    "max_tokens": gateway.max_output_tokens,
                    "temperature": gateway.temperature,
                    "stream": true,
                    "messages": turns,
                });
                if let Some(system) = system {
                    body["system"] = Value::String(system);
                }
                UpstreamRequest {
                    url: upstream::join_url(&self.base_url, "/v1/messages"),
                    auth: UpstreamAuth::Header("x-api-key"),
                    extra_headers: &[("anthropic-version", "2023-06-01")],
                    body,
                }
            }
            Provider::Google => {
                let system = join_system(messages);
                let contents: Vec<Value> = messages
                    .iter()
                    .filter(|m| m.role != Role::System)
                    .map(|m| {
                        let role = if m.role == Role::Assistant { "model" } else { "user" };
                        json!({ "role": role, "parts": [{ "text": m.content }] })
                    })
                    .collect();
                let mut body = json!({
                    "contents": contents,
                    "generationConfig": { "temperature": gateway.temperature },
                });
                if let Some(system) = system {
                    body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
                }
                let model_id = model_id.trim();
                UpstreamRequest {
                    url: upstream::join_url(
                        &self.base_url,
                        &format!("/v1beta/models/{model_id}:streamGenerateContent?alt=sse"),
                    ),
                    auth: UpstreamAuth::Header("x-goog-api-key"),
                    extra_headers: &[],
                    body,
                }
            }
        }
    }

    pub async fn open(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        gateway: &GatewayConfig,
    ) -> Result<reqwest::Response, UpstreamCallError> {
        let request = self.build_request(model_id, messages, gateway);
        upstream::open_stream(&self.http, &self.api_key, &request).await
    }

    /// Decodes one SSE event. `event` is the SSE event name, which Anthropic
    /// sets and the others leave as `message`.
    pub fn decode_event(&self, event: &str, data: &str) -> Result<StreamEvent, UpstreamCallError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(StreamEvent::Skip);
        }
        match self.provider {
            Provider::OpenAi => decode_openai(data),
            Provider::Anthropic => decode_anthropic(event, data),
            Provider::Google => decode_google(data),
        }
    }
}

fn join_system(messages: &[ChatMessage]) -> Option<String> {
    let parts: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn parse_json(data: &str) -> Result<Value, UpstreamCallError> {
    serde_json::from_str(data).map_err(|err| {
        UpstreamCallError::new(
            UpstreamErrorKind::Stream,
            None,
            format!("undecodable stream payload: {err}"),
        )
    })
}

fn stream_error(value: &Value) -> Option<UpstreamCallError> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| error.to_string());
    let code = ["code", "type", "status"]
        .iter()
        .find_map(|key| error.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.to_string());
    Some(UpstreamCallError::new(UpstreamErrorKind::Stream, None, message).with_code(code))
}

fn decode_openai(data: &str) -> Result<StreamEvent, UpstreamCallError> {
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    let value = parse_json(data)?;
    if let Some(err) = stream_error(&value) {
        return Err(err);
    }
    let text = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if text.is_empty() {
        Ok(StreamEvent::Skip)
    } else {
        Ok(StreamEvent::Text(text.to_string()))
    }
}

fn decode_anthropic(event: &str, data: &str) -> Result<StreamEvent, UpstreamCallError> {
    let value = parse_json(data)?;
    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or(event);
    match event_type {
        "content_block_delta" => {
            let delta = value.get("delta");
            let is_text = delta
                .and_then(|d| d.get("type"))
                .and_then(|v| v.as_str())
                == Some("text_delta");
            let text = delta
                .and_then(|d| d.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if is_text && !text.is_empty() {
                Ok(StreamEvent::Text(text.to_string()))
            } else {
                Ok(StreamEvent::Skip)
            }
        }
        "message_stop" => Ok(StreamEvent::Done),
        "error" => Err(stream_error(&value).unwrap_or_else(|| {
            UpstreamCallError::new(UpstreamErrorKind::Stream, None, data.to_string())
        })),
        _ => Ok(StreamEvent::Skip),
    }
}

fn decode_google(data: &str) -> Result<StreamEvent, UpstreamCallError> {
    let value = parse_json(data)?;
    if let Some(err) = stream_error(&value) {
        return Err(err);
    }
    let Some(parts) = value
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    else {
        return Ok(StreamEvent::Skip);
    };
    let text: String = parts
        .iter()
        .filter(|part| part.get("thought").and_then(|v| v.as_bool()) != Some(true))
        .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
        .collect();
    if text.is_empty() {
        Ok(StreamEvent::Skip)
    } else {
        Ok(StreamEvent::Text(text))
    }
}
