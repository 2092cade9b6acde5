use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use sdgate_core::{build, encode, JobDefaults, Orchestrator, Outcome};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

// Application state containing the preloaded engine and server-wide defaults.
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub defaults: JobDefaults,
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn generate_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    // Engine calls block; keep them off the async workers.
    match tokio::task::spawn_blocking(move || handle_post(&state, &body)).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = %err, "request worker panicked");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
        }
    }
}

/// Runs one request end to end and maps the outcome onto an HTTP response.
pub fn handle_post(state: &AppState, body: &[u8]) -> Response {
    let started = Instant::now();
    let job = match build(body, &state.defaults) {
        Ok(job) => job,
        Err(err) => {
            warn!(error = %err, "rejected request");
            return text(StatusCode::BAD_REQUEST, err.to_string());
        }
    };
    debug!(
        mode = %job.mode,
        width = job.width,
        height = job.height,
        steps = job.sample_steps,
        sampler = %job.sample_method,
        format = %job.output_format,
        "parsed request"
    );

    let (format, quality) = (job.output_format, job.output_quality);
    let outcome = match state.orchestrator.run(&job) {
        Ok(outcome) => outcome,
        Err(err) if err.is_client_error() => {
            warn!(error = %err, "rejected request");
            return text(StatusCode::BAD_REQUEST, err.to_string());
        }
        Err(err) => {
            error!(error = %err, mode = %job.mode, "request failed");
            return text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };

    match outcome {
        Outcome::Image(image) => match encode(image, format, quality) {
            Ok(bytes) => {
                info!(
                    mode = %job.mode,
                    bytes = bytes.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "request served"
                );
                (StatusCode::OK, [(CONTENT_TYPE, format.content_type())], bytes).into_response()
            }
            Err(err) => {
                error!(error = %err, "failed to encode result");
                text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        },
        Outcome::Converted(path) => {
            info!(output = %path.display(), "conversion served");
            text(StatusCode::OK, format!("model written to {}", path.display()))
        }
    }
}

fn text(status: StatusCode, message: String) -> Response {
    (status, [(CONTENT_TYPE, TEXT_PLAIN)], message).into_response()
}
