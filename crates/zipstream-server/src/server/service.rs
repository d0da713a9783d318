//! HTTP routes for the archive service.
//!
//! Two routes: the static landing page at `/`, and the streaming archive
//! download at `/archive/{identifier}/`. The archive handler performs the
//! existence gate, commits the response headers, and hands the transfer to
//! a relay task; from then on the response body is fed from a bounded
//! channel, so the transport's backpressure reaches all the way back to the
//! compressor subprocess.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use zipstream::pipeline::{self, CHUNK_CHANNEL_CAPACITY};
use zipstream::{resolve, Error, ServerConfig};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Cancelled on shutdown; every in-flight relay observes it and kills
    /// its compressor promptly instead of streaming into a dying server.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Builds the application router. Separate from `main` so tests can drive
/// it without a socket.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/archive/{identifier}/", get(archive))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the landing page from disk.
async fn index_page(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(&state.config.index_path).await {
        Ok(contents) => Html(contents).into_response(),
        Err(e) => {
            tracing::error!(
                "failed to read index page {:?}: {e}",
                state.config.index_path
            );
            (StatusCode::INTERNAL_SERVER_ERROR, "500 Index page unavailable").into_response()
        }
    }
}

/// Streams a ZIP archive of the identified directory.
///
/// Failures before this function returns (unknown identifier, spawn
/// failure) become proper HTTP statuses via [`Error::into_response`].
/// Anything after that point is the relay task's problem: the headers are
/// already committed, so later failures can only truncate the body.
async fn archive(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Result<Response, Error> {
    resolve::resolve_archive_dir(&state.config.base_dir, &identifier).await?;

    let child = pipeline::spawn_compressor(&state.config, &identifier)?;
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

    let config = Arc::clone(&state.config);
    let cancel = state.shutdown.child_token();
    let disposition = format!("attachment; filename=\"{identifier}.zip\"");
    tokio::spawn(async move {
        pipeline::relay(child, &identifier, chunk_tx, &config, cancel).await;
    });

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReceiverStream::new(chunk_rx)),
    )
        .into_response())
}
