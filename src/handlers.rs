use std::{convert::Infallible, time::Instant};

use axum::{
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    backend::BackendKind,
    errors::AppError,
    health::check_health,
    models::{rough_token_estimate, GenerateBody, StreamChunk},
    state::AppState,
    stats::RecentWindow,
};

pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "MiniVault local generation API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "generate": "POST /generate",
            "health": "GET /health",
            "logs/stats": "GET /logs/stats",
            "models/info": "GET /models/info",
            "models/reload": "POST /models/reload",
            "metrics": "GET /metrics"
        }
    }))
}

pub async fn health(State(state): State<AppState>) -> Response {
    Json(check_health(&state.registry, &state.logger).await).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn generate(State(state): State<AppState>, Json(body): Json<GenerateBody>) -> Response {
    let started = Instant::now();
    let stream = body.stream;
    let _inflight = state.metrics.inflight_guard();

    let response = match process_generate(state.clone(), body).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/generate",
        "POST",
        stream,
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

async fn process_generate(state: AppState, body: GenerateBody) -> Result<Response, AppError> {
    let request = body
        .into_request(&state.prompt_limits)
        .map_err(AppError::Validation)?;
    info!(
        request_id = %request.request_id,
        stream = request.stream,
        prompt_chars = request.prompt.chars().count(),
        backend = ?request.backend,
        "generate request accepted"
    );

    if !request.stream {
        let result = state.service.generate(request).await?;
        return Ok(Json(result).into_response());
    }

    let handle = state.service.generate_stream(request).await?;
    let (mut chunks, cancel, _outcome) = handle.into_parts();

    let outbound = async_stream::stream! {
        // Cancels the generation if the client goes away mid-stream.
        let _disconnect = cancel.drop_guard();
        let mut chunk_id = 0u64;
        let mut text = String::new();

        while let Some(next) = chunks.recv().await {
            match next {
                Ok(token) => {
                    text.push_str(&token);
                    yield Ok::<Event, Infallible>(json_event(StreamChunk::token(chunk_id, token)));
                    chunk_id += 1;
                }
                Err(error) => {
                    warn!(error = %error, "backend stream error");
                    let error_json = json!({
                        "error": {
                            "message": error.to_string(),
                            "type": "backend_error"
                        }
                    });
                    yield Ok::<Event, Infallible>(Event::default().data(error_json.to_string()));
                    break;
                }
            }
        }

        let last = StreamChunk::last(chunk_id, rough_token_estimate(&text));
        yield Ok::<Event, Infallible>(json_event(last));
    };

    Ok(Sse::new(outbound)
        .keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub recent: Option<usize>,
    pub hours: Option<u64>,
}

pub async fn log_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let window = match (query.recent, query.hours) {
        (Some(records), _) => RecentWindow::Records(records),
        (None, Some(hours)) => {
            RecentWindow::Within(std::time::Duration::from_secs(hours.saturating_mul(3_600)))
        }
        (None, None) => RecentWindow::Within(state.stats_window),
    };

    match state.stats.compute_stats(window).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(error) => {
            state.metrics.observe_stats_error();
            warn!(error = %error, "stats computation failed");
            AppError::from(error).into_response()
        }
    }
}

pub async fn model_info(State(state): State<AppState>) -> Response {
    let backend = state.registry.selected();
    let capabilities = match backend.kind() {
        BackendKind::Stub => vec!["text_generation", "streaming", "category_based_responses"],
        BackendKind::LocalModel | BackendKind::RemoteModel => {
            vec!["text_generation", "streaming"]
        }
    };
    Json(json!({
        "backend": backend.descriptor(),
        "ready": backend.is_ready(),
        "capabilities": capabilities,
    }))
    .into_response()
}

pub async fn reload_model(State(state): State<AppState>) -> Response {
    let backend = state.registry.selected();
    if backend.kind() == BackendKind::Stub {
        return Json(json!({
            "status": "no_reload_needed",
            "backend": backend.descriptor(),
        }))
        .into_response();
    }

    match backend.reload().await {
        Ok(()) => {
            info!(backend = %backend.name(), "backend reloaded");
            Json(json!({
                "status": "reloaded",
                "backend": backend.descriptor(),
            }))
            .into_response()
        }
        Err(error) => AppError::from(error).into_response(),
    }
}

fn json_event<T: serde::Serialize>(payload: T) -> Event {
    match serde_json::to_string(&payload) {
        Ok(serialized) => Event::default().data(serialized),
        Err(error) => {
            let fallback = json!({
                "error": {
                    "message": format!("serialization error: {error}"),
                    "type": "server_error"
                }
            });
            Event::default().data(fallback.to_string())
        }
    }
}
