//! Pass-through of one upstream generation to one downstream SSE response.
//!
//! Chunks are forwarded in arrival order. A successful stream ends with exactly
//! one metadata frame; a failed one ends with exactly one error frame and no
//! metadata. Dropping the downstream receiver cancels the upstream call.

use crate::config::GatewayConfig;
use crate::messages::ChatMessage;
use crate::providers::{ModelRoute, Provider, ProviderClient, StreamEvent};
use crate::upstream::{UpstreamCallError, UpstreamErrorKind};
use axum::response::sse::Event;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Text { text: String },
    Metadata { model: String },
    Error { message: String },
}

impl Frame {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Metadata { .. } => "metadata",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_event(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(self.event_name()).data(data)
    }

    /// Metadata and error frames end a stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Text { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Completed,
    UpstreamError,
    Cancelled,
    Timeout,
}

impl RelayOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::UpstreamError => "upstream_error",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

enum Halt {
    Upstream(UpstreamCallError),
    Cancelled,
    Timeout,
}

/// Drives a single generation. `open` yields the decoded upstream event
/// stream; it is not polled at all if the receiver is already gone.
pub async fn relay<F, S>(
    provider: Provider,
    composite: &str,
    open: F,
    tx: mpsc::Sender<Frame>,
    deadline: Duration,
) -> RelayOutcome
where
    F: Future<Output = Result<S, UpstreamCallError>>,
    S: Stream<Item = Result<StreamEvent, UpstreamCallError>>,
{
    let work = async {
        match open.await {
            Ok(events) => pump(events, &tx).await,
            Err(err) => Err(Halt::Upstream(err)),
        }
    };
    let result = tokio::select! {
        biased;
        _ = tx.closed() => Err(Halt::Cancelled),
        res = tokio::time::timeout(deadline, work) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Halt::Timeout),
        },
    };

    let outcome = match result {
        Ok(()) => {
            let metadata = Frame::Metadata {
                model: composite.to_string(),
            };
            if tx.send(metadata).await.is_ok() {
                RelayOutcome::Completed
            } else {
                RelayOutcome::Cancelled
            }
        }
        Err(Halt::Upstream(err)) => {
            tracing::warn!(
                provider = provider.as_str(),
                model = composite,
                kind = ?err.kind,
                status = ?err.status,
                code = ?err.code,
                "upstream generation failed: {}",
                err.message
            );
            send_error(provider, &tx).await;
            RelayOutcome::UpstreamError
        }
        Err(Halt::Timeout) => {
            tracing::warn!(
                provider = provider.as_str(),
                model = composite,
                deadline_ms = deadline.as_millis() as u64,
                "generation deadline exceeded"
            );
            send_error(provider, &tx).await;
            RelayOutcome::Timeout
        }
        Err(Halt::Cancelled) => {
            tracing::debug!(provider = provider.as_str(), model = composite, "caller went away");
            RelayOutcome::Cancelled
        }
    };
    metrics::counter!(
        "chatgate_relay_streams_total",
        "provider" => provider.as_str(),
        "result" => outcome.as_str()
    )
    .increment(1);
    outcome
}

async fn send_error(provider: Provider, tx: &mpsc::Sender<Frame>) {
    let _ = tx
        .send(Frame::Error {
            message: provider.failure_message().to_string(),
        })
        .await;
}

async fn pump<S>(events: S, tx: &mpsc::Sender<Frame>) -> Result<(), Halt>
where
    S: Stream<Item = Result<StreamEvent, UpstreamCallError>>,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        match event.map_err(Halt::Upstream)? {
            StreamEvent::Text(text) => {
                tx.send(Frame::Text { text })
                    .await
                    .map_err(|_| Halt::Cancelled)?;
            }
            StreamEvent::Done => return Ok(()),
            StreamEvent::Skip => {}
        }
    }
    Ok(())
}

/// Opens the upstream call on a background task and returns the frame
/// receiver to serve downstream.
pub fn spawn_relay(
    client: ProviderClient,
    route: ModelRoute,
    messages: Vec<ChatMessage>,
    gateway: GatewayConfig,
) -> mpsc::Receiver<Frame> {
    let (tx, rx) = mpsc::channel::<Frame>(64);
    let deadline = Duration::from_millis(gateway.generation_timeout_ms);
    tokio::spawn(async move {
        let provider = client.provider();
        let open = async {
            let resp = client.open(&route.model_id, &messages, &gateway).await?;
            let decoder = client.clone();
            let events = resp.bytes_stream().eventsource().map(move |item| match item {
                Ok(ev) => decoder.decode_event(&ev.event, &ev.data),
                Err(err) => Err(UpstreamCallError::new(
                    UpstreamErrorKind::Network,
                    None,
                    err.to_string(),
                )),
            });
            Ok::<_, UpstreamCallError>(events)
        };
        relay(provider, &route.composite, open, tx, deadline).await;
    });
    rx
}
