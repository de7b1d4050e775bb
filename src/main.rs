use axum::http::StatusCode;
use chatgate::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,chatgate=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        tracing::error!(code = %err.code, "chatgate stopped: {}", err.message);
        std::process::exit(1);
    }
}

fn startup_error(code: &str, err: impl std::fmt::Display) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, err.to_string())
}

async fn run() -> Result<(), AppError> {
    let state = chatgate::app::load_state().await?;
    let runtime = state.runtime.clone();
    tracing::info!(
        database = %runtime.database_dsn,
        openai = %runtime.providers.openai,
        anthropic = %runtime.providers.anthropic,
        google = %runtime.providers.google,
        anonymous_limit = runtime.quota.anonymous_limit,
        authenticated_limit = runtime.quota.authenticated_limit,
        generation_timeout_ms = runtime.gateway.generation_timeout_ms,
        "gateway configured"
    );

    let addr: std::net::SocketAddr = runtime
        .listen
        .parse()
        .map_err(|err| startup_error("listen_invalid", err))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed", err))?;
    tracing::info!(%addr, metrics_path = %runtime.metrics_path, "gateway listening");

    let app = chatgate::app::build_app(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| startup_error("serve_failed", err))?;
    tracing::info!("gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM. In-flight streams run to completion.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("ctrl-c handler unavailable: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("SIGTERM handler unavailable: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
