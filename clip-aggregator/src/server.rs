use crate::aggregator::ClipAggregator;
use crate::types::{AggregatorError, ClipQuery, ClipQueryParams, ErrorResponse, ResolvedChannel};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Shared state for the handlers
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<ClipAggregator>,
}

impl IntoResponse for AggregatorError {
    fn into_response(self) -> Response {
        let status = match &self {
            AggregatorError::Validation(_) => StatusCode::BAD_REQUEST,
            AggregatorError::NotFound { .. } => StatusCode::NOT_FOUND,
            AggregatorError::Auth(_) | AggregatorError::Upstream { .. } | AggregatorError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorResponse {
            success: false,
            kind: self.kind().to_string(),
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

fn parse_query(params: ClipQueryParams) -> Result<ClipQuery, AggregatorError> {
    Ok(ClipQuery::try_from(params)?)
}

/// Handler for the streamed aggregation: one JSON array of clips per line.
async fn stream_clips(
    State(state): State<AppState>,
    Query(params): Query<ClipQueryParams>,
) -> Result<Response, AggregatorError> {
    let query = parse_query(params)?;
    let request_id = Uuid::new_v4();
    let span = info_span!("clips", %request_id);

    // Resolve before answering so a credential failure still gets a real status.
    let channels = state
        .aggregator
        .resolve_channels(&query)
        .instrument(span.clone())
        .await?;

    span.in_scope(|| {
        info!("Streaming clips for {} of {} requested channels", channels.len(), query.channels.len());
    });

    // Dropping the body (client hung up, or done) cancels the pipeline.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let lines = span
        .in_scope(|| state.aggregator.stream_channels(channels, &query, cancel))
        .map(move |line| {
            let _cancel_on_drop = &guard;
            Ok::<_, Infallible>(line)
        });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|e| {
            warn!("Failed to build stream response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }))
}

/// Handler for the quick first-page preview
async fn preview_clips(
    State(state): State<AppState>,
    Query(params): Query<ClipQueryParams>,
) -> Result<impl IntoResponse, AggregatorError> {
    let query = parse_query(params)?;
    let clips = state.aggregator.preview(&query).await?;
    info!("Preview: {} clips for {} channels", clips.len(), query.channels.len());
    Ok(Json(clips))
}

/// Handler resolving a channel name to its id
async fn channel_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ResolvedChannel>, AggregatorError> {
    if !interfaces::is_valid_channel_name(&name) {
        return Err(AggregatorError::NotFound { name });
    }
    let channel = state.aggregator.identity().require(&name).await?;
    Ok(Json(channel))
}

/// Handler resolving a channel id to its name
async fn channel_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResolvedChannel>, AggregatorError> {
    match state.aggregator.identity().resolve_name(&id).await? {
        Some(name) => Ok(Json(ResolvedChannel { id, name })),
        None => Err(AggregatorError::NotFound { name: id }),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Create the router for the clip API
pub fn create_router(aggregator: Arc<ClipAggregator>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/clips", get(stream_clips))
        .route("/api/clips/preview", get(preview_clips))
        .route("/api/channels/by-name/{name}", get(channel_by_name))
        .route("/api/channels/by-id/{id}", get(channel_by_id))
        .with_state(AppState { aggregator })
}

/// Serve the clip API until the listener fails or `shutdown` fires.
pub async fn serve(listener: TcpListener, aggregator: Arc<ClipAggregator>, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Clip server listening on {}", addr);
    }
    axum::serve(listener, create_router(aggregator))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
