//! HTTP API Server
//!
//! Source side of a clone: version listing, snapshot make/release and file
//! download for peers cloning tablets from this node.

use std::future::Future;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Json, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::snapshot::{SnapshotMaker, SnapshotScope};
use crate::tablet::{SchemaHash, TabletId, VersionRange};

/// Shared application state
pub struct AppState {
    /// Node ID
    pub node_id: String,
    /// Snapshot maker over the local engine
    pub maker: Arc<SnapshotMaker>,
    /// Token required on every /api request when set
    pub token: Option<String>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, node_id: String, maker: Arc<SnapshotMaker>) -> Self {
        let state = Arc::new(AppState {
            node_id,
            maker,
            token: config.token.clone(),
        });
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/api/tablets/:tablet_id/versions", get(handle_versions))
            .route("/api/tablets/:tablet_id/snapshot", post(handle_make_snapshot))
            .route("/api/snapshot", delete(handle_release_snapshot))
            .route("/api/_download", get(handle_download).head(handle_download))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server and run until `shutdown` resolves
    pub async fn start(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        self.serve_on(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve_on(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))
    }
}

// ============ Request/Response Types ============

/// Snapshot request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub schema_hash: SchemaHash,
    /// Exact rowset versions to include; all rowsets when absent
    #[serde(default)]
    pub versions: Option<Vec<VersionRange>>,
}

/// Token carried in the query string
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Release query
#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub path: String,
    pub token: Option<String>,
}

/// Download query
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub file: Option<String>,
    pub token: Option<String>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error rendered as a JSON body
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::VersionUnavailable(_) | Error::TabletNotFound(_) => StatusCode::NOT_FOUND,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string());
            }
            Error::ValidationFailed(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn check_token(state: &AppState, token: Option<&str>) -> ApiResult<()> {
    match &state.token {
        Some(expected) if token != Some(expected.as_str()) => {
            Err(ApiError::forbidden("invalid or missing token"))
        }
        _ => Ok(()),
    }
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: true,
        node_id: state.node_id.clone(),
    })
}

async fn handle_versions(
    State(state): State<Arc<AppState>>,
    Path(tablet_id): Path<TabletId>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<impl IntoResponse> {
    check_token(&state, query.token.as_deref())?;
    let versions = state.maker.list_versions(tablet_id).await?;
    Ok(Json(versions))
}

async fn handle_make_snapshot(
    State(state): State<Arc<AppState>>,
    Path(tablet_id): Path<TabletId>,
    Query(query): Query<TokenQuery>,
    Json(req): Json<SnapshotRequest>,
) -> ApiResult<impl IntoResponse> {
    check_token(&state, query.token.as_deref())?;
    let scope = match req.versions {
        Some(ranges) => SnapshotScope::Versions(ranges),
        None => SnapshotScope::Full,
    };
    let snapshot = state.maker.make(tablet_id, req.schema_hash, &scope).await?;
    Ok(Json(snapshot))
}

async fn handle_release_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReleaseQuery>,
) -> ApiResult<StatusCode> {
    check_token(&state, query.token.as_deref())?;
    state.maker.release(FsPath::new(&query.path))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Serve a snapshot file, or a newline separated listing for a directory
async fn handle_download(
    State(state): State<Arc<AppState>>,
    method: Method,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let Some(file) = query.file.filter(|f| !f.is_empty()) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "file parameter is required",
        ));
    };
    check_token(&state, query.token.as_deref())?;

    let path: PathBuf = state
        .maker
        .resolve_path(FsPath::new(&file))?
        .ok_or_else(|| {
            tracing::warn!("Refused download of {} outside the snapshot root", file);
            ApiError::forbidden(format!("{} is not downloadable", file))
        })?;

    let metadata = tokio::fs::metadata(&path).await.map_err(Error::from)?;
    if metadata.is_dir() {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&path).await.map_err(Error::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::from)? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        let listing = names.join("\n");
        return Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            listing,
        )
            .into_response());
    }

    let length = metadata.len().to_string();
    if method == Method::HEAD {
        return Ok(([(header::CONTENT_LENGTH, length)], Body::empty()).into_response());
    }

    let handle = tokio::fs::File::open(&path).await.map_err(Error::from)?;
    tracing::debug!("Serving {:?} ({} bytes)", path, length);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, length),
        ],
        Body::from_stream(ReaderStream::new(handle)),
    )
        .into_response())
}
