//! HTTP API for the Gitgate node.
//!
//! Implements the git smart HTTP endpoints on top of `gitgate-git` sessions.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gitgate_git::{
    advertise_refs, GitCommand, GitError, RequestHeaders, ServiceKind, ServiceRequest,
    ServiceSession, SessionEvent, SessionEvents,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gate::{AccessRequest, Decision, Gatekeeper, PolicyGate};
use crate::observability::request_id_middleware;

/// Capacity of the pipe between a session and its HTTP response body.
const RESPONSE_BUFFER: usize = 64 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Node configuration.
    pub config: Arc<Config>,
    /// Access decision hook.
    pub gate: Arc<dyn Gatekeeper>,
}

impl AppState {
    /// Creates state with the configuration-driven [`PolicyGate`].
    pub fn new(config: Config) -> Self {
        let gate = Arc::new(PolicyGate::from_config(&config));
        Self {
            config: Arc::new(config),
            gate,
        }
    }

    /// Resolves a repository name to its directory under the project root.
    fn resolve_repo(&self, repo: &str) -> Result<PathBuf, ApiError> {
        if repo.is_empty() || repo.starts_with('.') || repo.contains(['/', '\\']) {
            return Err(ApiError::RepoNotFound(repo.to_string()));
        }

        let path = self.config.project_root.join(repo);
        if !path.is_dir() {
            return Err(ApiError::RepoNotFound(repo.to_string()));
        }
        Ok(path)
    }
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("timed out waiting for the request body")]
    BodyTimeout,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("git error: {0}")]
    Git(#[from] GitError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::RepoNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BodyTimeout => StatusCode::REQUEST_TIMEOUT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Git(GitError::UnknownService(_)) => StatusCode::BAD_REQUEST,
            ApiError::Git(GitError::Body(_) | GitError::Decode { .. }) => StatusCode::BAD_REQUEST,
            ApiError::Git(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            debug!(error = %self, status = %status, "request refused");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Git smart HTTP protocol
        .route("/{repo}/info/refs", get(git_info_refs))
        .route("/{repo}/git-upload-pack", post(git_upload_pack))
        .route("/{repo}/git-receive-pack", post(git_receive_pack))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Git info/refs endpoint - advertises references.
async fn git_info_refs(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let service = params
        .get("service")
        .ok_or_else(|| ApiError::BadRequest("missing service parameter".to_string()))?;
    let kind: ServiceKind = service.parse()?;
    let cwd = state.resolve_repo(&repo)?;

    let command = GitCommand::new(state.config.git_command.clone());
    let body = advertise_refs(&command, kind, &cwd).await?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, kind.advertisement_content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response())
}

/// Git upload-pack endpoint - handles fetch/clone.
async fn git_upload_pack(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    serve_pack(state, repo, ServiceKind::UploadPack, headers, body).await
}

/// Git receive-pack endpoint - handles push.
async fn git_receive_pack(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    serve_pack(state, repo, ServiceKind::ReceivePack, headers, body).await
}

/// Buffers the request, asks the gatekeeper, and streams the session's response.
async fn serve_pack(
    state: AppState,
    repo: String,
    kind: ServiceKind,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let cwd = state.resolve_repo(&repo)?;
    let request = ServiceRequest {
        repo,
        kind,
        cwd,
        headers: RequestHeaders::from_pairs(
            headers
                .iter()
                .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
        ),
    };

    let (sink, source) = tokio::io::duplex(RESPONSE_BUFFER);
    let (mut session, mut events) = ServiceSession::new(request, sink, state.config.session());

    let complete = tokio::time::timeout(
        state.config.body_timeout(),
        session.ingest(body.into_data_stream()),
    )
    .await
    .map_err(|_| ApiError::BodyTimeout)??;
    if !complete {
        return Err(ApiError::BadRequest(
            "request body ended before content-length".to_string(),
        ));
    }

    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Header(record) = event {
            debug!(
                repo = %session.repo(),
                action = record.action().as_str(),
                commit = record.commit(),
                "negotiation parsed"
            );
        }
    }

    let decision = state.gate.decide(&AccessRequest::from_session(&session));
    tokio::spawn(drive(session, events, decision));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, kind.result_content_type()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        Body::from_stream(ReaderStream::new(source)),
    )
        .into_response())
}

/// Applies the decision and follows the session until its response ends.
async fn drive(
    mut session: ServiceSession<DuplexStream>,
    mut events: SessionEvents,
    decision: Decision,
) {
    match decision {
        Decision::Reject(message) => {
            if let Err(e) = session.reject(&message).await {
                warn!(repo = %session.repo(), error = %e, "failed to write rejection");
            }
            return;
        }
        Decision::Accept => {
            if session.accept().is_none() {
                return;
            }
        }
    }

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Service { pid, command } => {
                debug!(repo = %session.repo(), ?pid, command = %command, "pack service started");
            }
            SessionEvent::Exit { status } => {
                info!(
                    repo = %session.repo(),
                    service = %session.kind(),
                    action = session.action().map(|a| a.as_str()).unwrap_or("-"),
                    ?status,
                    "pack service finished"
                );
                break;
            }
            SessionEvent::Error(e) => {
                error!(repo = %session.repo(), error = %e, "pack service failed");
                let response = session.response();
                if let Err(e) = response.fatal(&e.to_string()).await {
                    debug!(error = %e, "failed to report pack service failure");
                }
                if let Err(e) = response.finalize().await {
                    debug!(error = %e, "failed to end response");
                }
                break;
            }
            SessionEvent::Header(_) | SessionEvent::Buffer(_) => {}
        }
    }
}
