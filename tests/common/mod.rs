#![allow(dead_code)]

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::post;
use chatgate::messages::{Conversation, Message, Role};
use chatgate::store::ChatStore;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

pub const IDENTITY_SECRET: &str = "test-identity-secret";
pub const FAIL_AFTER_TWO: &str = "FAIL_AFTER_TWO";
pub const UPSTREAM_HTTP_ERROR: &str = "UPSTREAM_HTTP_ERROR";

/// What the mock upstream saw.
#[derive(Default)]
pub struct UpstreamLog {
    pub hits: AtomicUsize,
    pub headers: Mutex<Vec<(String, String)>>,
    pub bodies: Mutex<Vec<Value>>,
}

impl UpstreamLog {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn last_body(&self) -> Value {
        self.bodies.lock().unwrap().last().cloned().unwrap_or(Value::Null)
    }

    fn record(&self, headers: &HeaderMap, body: &Value) {
        self.hits.fetch_add(1, Ordering::SeqCst);
        let mut lock = self.headers.lock().unwrap();
        for name in ["authorization", "x-api-key", "anthropic-version", "x-goog-api-key"] {
            if let Some(v) = headers.get(name).and_then(|h| h.to_str().ok()) {
                lock.push((name.to_string(), v.to_string()));
            }
        }
        self.bodies.lock().unwrap().push(body.clone());
    }
}

fn body_mentions(body: &Value, marker: &str) -> bool {
    body.to_string().contains(marker)
}

fn sse(events: Vec<Event>) -> Response {
    Sse::new(futures_util::stream::iter(
        events.into_iter().map(Ok::<_, Infallible>),
    ))
    .into_response()
}

fn forced_http_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": {
                "code": "server_error",
                "message": "internal detail: shard 7 at 10.0.0.12 is down"
            }
        })),
    )
        .into_response()
}

pub async fn start_upstream() -> (SocketAddr, Arc<UpstreamLog>) {
    let log = Arc::new(UpstreamLog::default());

    async fn openai(
        axum::extract::State(log): axum::extract::State<Arc<UpstreamLog>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        log.record(&headers, &body);
        if body_mentions(&body, UPSTREAM_HTTP_ERROR) {
            return forced_http_error();
        }
        let chunk = |text: &str| {
            Event::default().data(
                json!({"id": "c1", "choices": [{"index": 0, "delta": {"content": text}}]})
                    .to_string(),
            )
        };
        if body_mentions(&body, FAIL_AFTER_TWO) {
            return sse(vec![
                chunk("first"),
                chunk("second"),
                Event::default().data(
                    json!({"error": {"message": "upstream connection reset by 10.0.0.12", "code": "server_error"}})
                        .to_string(),
                ),
                chunk("never"),
            ]);
        }
        sse(vec![
            Event::default().data(
                json!({"id": "c1", "choices": [{"index": 0, "delta": {"role": "assistant"}}]})
                    .to_string(),
            ),
            chunk("Hello"),
            chunk(", "),
            chunk("world"),
            Event::default().data("[DONE]"),
        ])
    }

    async fn anthropic(
        axum::extract::State(log): axum::extract::State<Arc<UpstreamLog>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        log.record(&headers, &body);
        if body_mentions(&body, UPSTREAM_HTTP_ERROR) {
            return forced_http_error();
        }
        let delta = |text: &str| {
            Event::default().event("content_block_delta").data(
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}})
                    .to_string(),
            )
        };
        sse(vec![
            Event::default()
                .event("message_start")
                .data(json!({"type": "message_start", "message": {"id": "msg_1"}}).to_string()),
            Event::default().event("ping").data(json!({"type": "ping"}).to_string()),
            delta("Hi"),
            delta(" from claude"),
            Event::default()
                .event("message_stop")
                .data(json!({"type": "message_stop"}).to_string()),
        ])
    }

    async fn google(
        axum::extract::State(log): axum::extract::State<Arc<UpstreamLog>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        log.record(&headers, &body);
        if body_mentions(&body, UPSTREAM_HTTP_ERROR) {
            return forced_http_error();
        }
        let part = |text: &str| {
            Event::default().data(
                json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]})
                    .to_string(),
            )
        };
        sse(vec![part("Gem"), part("ini")])
    }

    let router = Router::new()
        .route("/v1/chat/completions", post(openai))
        .route("/v1/messages", post(anthropic))
        .route("/v1beta/models/{*rest}", post(google))
        .with_state(Arc::clone(&log))
        .layer(axum::extract::DefaultBodyLimit::disable());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, log)
}

pub struct TestContext {
    pub router: Router,
    pub state: chatgate::app::AppState,
    pub upstream: Arc<UpstreamLog>,
    _temp_dir: TempDir,
}

pub async fn setup() -> TestContext {
    let (upstream_addr, upstream) = start_upstream().await;
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("chatgate.db");
    let runtime = chatgate::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        identity_secret: Some(IDENTITY_SECRET.to_string()),
        providers: chatgate::config::ProviderEndpoints::all(&format!("http://{upstream_addr}")),
        ..chatgate::app::RuntimeConfig::default()
    };
    let state = chatgate::app::load_state_with_runtime(runtime)
        .await
        .expect("load state");
    TestContext {
        router: chatgate::app::build_app(state.clone()),
        state,
        upstream,
        _temp_dir: temp_dir,
    }
}

/// Serves the gateway on a real socket, for clients that speak HTTP.
pub async fn serve(ctx: &TestContext) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = ctx.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub fn token_for(user_id: &str) -> String {
    let claims = chatgate::auth::IdentityClaims {
        sub: user_id.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(IDENTITY_SECRET.as_bytes()),
    )
    .unwrap()
}

/// Writes `count` messages into a fresh conversation owned as given.
pub async fn seed_messages(
    ctx: &TestContext,
    user_id: Option<&str>,
    session_id: Option<&str>,
    count: usize,
) {
    let conversation_id = chatgate::messages::new_id();
    ctx.state
        .store
        .create_conversation(&Conversation {
            id: conversation_id.clone(),
            name: "seeded".to_string(),
            created_at: chrono::Utc::now(),
            user_id: user_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
        })
        .await
        .unwrap();
    for i in 0..count {
        ctx.state
            .store
            .insert_message(&Message {
                id: chatgate::messages::new_id(),
                conversation_id: conversation_id.clone(),
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("seed {i}"),
                model: String::new(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }
}

pub fn chat_body(model: &str, content: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
    })
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl Reply {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }

    /// The JSON payloads of every SSE data line, in order.
    pub fn frames(&self) -> Vec<Value> {
        self.body
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).expect("frame json"))
            .collect()
    }
}

pub async fn send(ctx: &TestContext, req: Request<Body>) -> Reply {
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        body: String::from_utf8_lossy(&bytes).to_string(),
    }
}

/// POSTs to the chat endpoint. `identity` is `(session, token)`.
pub async fn chat(
    ctx: &TestContext,
    path: &str,
    api_key: Option<&str>,
    identity: (Option<&str>, Option<&str>),
    body: String,
) -> Reply {
    let mut req = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json");
    if let Some(key) = api_key {
        req = req.header(AUTHORIZATION, format!("Bearer {key}"));
    }
    req = with_identity(req, identity);
    send(ctx, req.body(Body::from(body)).unwrap()).await
}

pub fn with_identity(
    mut req: axum::http::request::Builder,
    (session, token): (Option<&str>, Option<&str>),
) -> axum::http::request::Builder {
    if let Some(session) = session {
        req = req.header("x-session-id", session);
    }
    if let Some(token) = token {
        req = req.header("x-token", token);
    }
    req
}

pub async fn get(ctx: &TestContext, path: &str, identity: (Option<&str>, Option<&str>)) -> Reply {
    let req = with_identity(Request::builder().method("GET").uri(path), identity);
    send(ctx, req.body(Body::empty()).unwrap()).await
}

pub async fn post_json(
    ctx: &TestContext,
    path: &str,
    identity: (Option<&str>, Option<&str>),
    body: Value,
) -> Reply {
    let req = with_identity(
        Request::builder()
            .method("POST")
            .uri(path)
            .header(CONTENT_TYPE, "application/json"),
        identity,
    );
    send(ctx, req.body(Body::from(body.to_string())).unwrap()).await
}
