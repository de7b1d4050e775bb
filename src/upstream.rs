use axum::http::StatusCode;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    /// The provider reported a failure inside an otherwise healthy stream.
    Stream,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub code: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            code: None,
            message,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

impl std::fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{:?} ({}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamAuth {
    Bearer,
    Header(&'static str),
}

/// A fully-built streaming request for one provider.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub auth: UpstreamAuth,
    pub extra_headers: &'static [(&'static str, &'static str)],
    pub body: Value,
}

/// Sends the request and hands back the still-open response. A non-2xx status
/// is an error carrying the provider's status and error code.
pub async fn open_stream(
    client: &reqwest::Client,
    api_key: &str,
    request: &UpstreamRequest,
) -> Result<reqwest::Response, UpstreamCallError> {
    let mut req = client
        .post(&request.url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(&request.body);
    req = match request.auth {
        UpstreamAuth::Bearer => req.bearer_auth(api_key),
        UpstreamAuth::Header(name) => req.header(name, api_key),
    };
    for (k, v) in request.extra_headers {
        req = req.header(*k, *v);
    }
    let resp = req
        .send()
        .await
        .map_err(|err| UpstreamCallError::new(UpstreamErrorKind::Network, None, err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        let code = extract_error_code(&text);
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            StatusCode::from_u16(status.as_u16()).ok(),
            format!("upstream status {}: {}", status, text),
        )
        .with_code(code));
    }
    Ok(resp)
}

pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if base.ends_with("/v1beta") {
        if let Some(stripped) = path.strip_prefix("v1beta/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

/// Provider error bodies put the code under `error.code` (OpenAI),
/// `error.type` (Anthropic) or `error.status` (Google).
pub fn extract_error_code(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error")?;
    ["code", "type", "status"]
        .iter()
        .find_map(|key| error.get(*key).and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}
