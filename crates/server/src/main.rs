use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{conversations, history, load_upload, store_upload, ApiContext};
use shared::{
    domain::{MessageKind, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, MessagePayload, UploadResponse},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod auth;
mod config;
mod registry;
mod router;
mod ws;

use app_state::AppState;
use auth::require_user;
use config::{load_settings, prepare_database_url};

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    message_type: String,
}

const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState::new(
        ApiContext { storage },
        settings.jwt_secret.as_str(),
        settings.max_upload_bytes,
        settings.outbound_queue,
    );
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/:user_id", get(ws::ws_handler))
        .route("/messages/:peer_id", get(http_history))
        .route("/conversations", get(http_conversations))
        .route(
            "/files/upload",
            post(upload_file)
                .layer::<_, std::convert::Infallible>(RequestBodyLimitLayer::new(upload_limit))
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/files/:filename", get(download_file))
        .with_state(state)
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(peer_id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let user = require_user(&state, &headers).await?;
    let messages = history(&state.api, user.id, UserId(peer_id), q.limit, q.offset)
        .await
        .map_err(api_rejection)?;
    Ok(Json(messages))
}

async fn http_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, (StatusCode, Json<ApiError>)> {
    let user = require_user(&state, &headers).await?;
    let summaries = conversations(&state.api, user.id)
        .await
        .map_err(api_rejection)?;
    Ok(Json(summaries))
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, Json<ApiError>)> {
    let user = require_user(&state, &headers).await?;
    let kind = MessageKind::parse(&q.message_type)
        .filter(|kind| kind.carries_upload())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(
                    ErrorCode::Validation,
                    "message_type must be image, video or circular_video",
                )),
            )
        })?;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(ErrorCode::Validation, e.to_string())),
        )
    })? {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|e| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(ApiError::new(ErrorCode::PayloadTooLarge, e.to_string())),
            )
        })?;
        let response = store_upload(
            &state.api,
            user.id,
            kind,
            &original_name,
            mime_type.as_deref(),
            &bytes,
            state.max_upload_bytes,
        )
        .await
        .map_err(api_rejection)?;
        return Ok(Json(response));
    }

    Err((
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, "missing multipart field `file`")),
    ))
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ApiError>)> {
    require_user(&state, &headers).await?;
    let file = load_upload(&state.api, &filename)
        .await
        .map_err(api_rejection)?;

    let mut response_headers = HeaderMap::new();
    let content_type = file
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    Ok((StatusCode::OK, response_headers, file.bytes))
}

fn api_rejection(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
