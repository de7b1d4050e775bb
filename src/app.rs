use crate::auth::{AuthState, JwtIdentityVerifier};
use crate::config::{GatewayConfig, ProviderEndpoints, env_parsed, env_string};
use crate::error::{AppError, AppResult};
use crate::quota::{QuotaEnforcer, QuotaPolicy};
use crate::store::{ChatStore, SqliteChatStore};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub auth: AuthState,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub store: Arc<dyn ChatStore>,
    pub quota: QuotaEnforcer,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub identity_secret: Option<String>,
    pub providers: ProviderEndpoints,
    pub gateway: GatewayConfig,
    pub quota: QuotaPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            metrics_path: "/metrics".to_string(),
            database_dsn: "sqlite://./data/chatgate.db".to_string(),
            identity_secret: None,
            providers: ProviderEndpoints::default(),
            gateway: GatewayConfig::default(),
            quota: QuotaPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let providers = ProviderEndpoints {
            openai: env_string("CHATGATE_OPENAI_BASE_URL").unwrap_or(defaults.providers.openai),
            anthropic: env_string("CHATGATE_ANTHROPIC_BASE_URL")
                .unwrap_or(defaults.providers.anthropic),
            google: env_string("CHATGATE_GOOGLE_BASE_URL").unwrap_or(defaults.providers.google),
        };
        let gateway = GatewayConfig {
            temperature: env_parsed("CHATGATE_TEMPERATURE")
                .unwrap_or(defaults.gateway.temperature),
            generation_timeout_ms: env_parsed("CHATGATE_GENERATION_TIMEOUT_MS")
                .unwrap_or(defaults.gateway.generation_timeout_ms),
            max_output_tokens: env_parsed("CHATGATE_MAX_OUTPUT_TOKENS")
                .unwrap_or(defaults.gateway.max_output_tokens),
        };
        let quota = QuotaPolicy {
            authenticated_limit: env_parsed("CHATGATE_AUTHENTICATED_LIMIT")
                .unwrap_or(defaults.quota.authenticated_limit),
            anonymous_limit: env_parsed("CHATGATE_ANONYMOUS_LIMIT")
                .unwrap_or(defaults.quota.anonymous_limit),
        };
        Self {
            listen: env_string("CHATGATE_LISTEN").unwrap_or(defaults.listen),
            metrics_path: env_string("CHATGATE_METRICS_PATH").unwrap_or(defaults.metrics_path),
            database_dsn: env_string("CHATGATE_DATABASE_DSN")
                .or_else(|| env_string("DATABASE_URL"))
                .unwrap_or(defaults.database_dsn),
            identity_secret: env_string("CHATGATE_IDENTITY_SECRET"),
            providers,
            gateway,
            quota,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let store = SqliteChatStore::connect(&runtime.database_dsn)
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "database_init_failed",
                err.to_string(),
            )
        })?;
    load_state_with_store(runtime, Arc::new(store))
}

/// Builds the state around an already constructed store.
pub fn load_state_with_store(
    runtime: RuntimeConfig,
    store: Arc<dyn ChatStore>,
) -> AppResult<AppState> {
    if runtime.identity_secret.is_none() {
        tracing::warn!("no identity secret configured; identity tokens will not verify");
    }
    let verifier = JwtIdentityVerifier::new(runtime.identity_secret.as_deref());
    let auth = AuthState::new(Arc::new(verifier));

    let http = reqwest::Client::builder()
        .user_agent("chatgate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let metrics = init_metrics()?;
    let quota = QuotaEnforcer::new(store.clone(), auth.clone(), runtime.quota);

    Ok(AppState {
        runtime: Arc::new(runtime),
        auth,
        http,
        metrics,
        store,
        quota,
    })
}

/// The Prometheus recorder is process-global; every state built in this
/// process shares one handle.
fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let api_router = build_api_router(&metrics_path);
    Router::<AppState>::new()
        .merge(api_router.clone())
        .nest("/api", api_router)
        .with_state(state)
        // Outermost last: the id is set before tracing sees the request.
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
}

fn build_api_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        // Reads its own body after the auth and quota gates.
        .route("/v1/chat", axum::routing::post(crate::handlers::chat))
        .route("/v1/models", get(crate::handlers::list_models))
        .route("/v1/usage", get(crate::handlers::usage))
        .route(
            "/v1/conversations",
            get(crate::conversation_handlers::list_conversations)
                .post(crate::conversation_handlers::create_conversation),
        )
        .route(
            "/v1/conversations/{conversation_id}/messages",
            get(crate::conversation_handlers::list_messages)
                .post(crate::conversation_handlers::create_message),
        )
        .route(metrics_path, get(crate::handlers::metrics))
}
