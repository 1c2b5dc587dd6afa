use crate::config::ApiConfig;
use crate::ingest::{check_declared_size, UploadIngestor, UploadRejection, UploadRequest, UploadedFile};
use crate::status::ConnectionStatus;
use crate::storage::{StorageTier, TierStorage};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

const PAYLOAD_ID_HEADER: &str = "x-rh-insights-request-id";
const TRACKING_ID_HEADER: &str = "tracking-id";
const IDENTITY_HEADER: &str = "x-rh-identity";
const UPLOAD_FIELD: &str = "upload";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<UploadIngestor>,
    pub storage: Arc<dyn TierStorage>,
    pub status: Arc<ConnectionStatus>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub upload_service: &'static str,
    pub message_queue_producer: &'static str,
    pub message_queue_consumer: &'static str,
    pub long_term_storage: &'static str,
    pub quarantine_storage: &'static str,
    pub rejected_storage: &'static str,
}

fn up_down(up: bool) -> &'static str {
    if up {
        "up"
    } else {
        "down"
    }
}

/// Create the API router, mounted under the configured path prefix
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let routes = Router::new()
        .route("/", get(root).options(root_options))
        .route(
            "/api/v1/upload",
            get(upload_info).post(upload).options(upload_options),
        )
        .route("/api/v1/version", get(version))
        .route("/api/v1/status", get(status));

    let prefix = config.path_prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(prefix, routes)
    };

    router
        .layer(DefaultBodyLimit::max(
            usize::try_from(config.max_length).unwrap_or(usize::MAX),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> &'static str {
    "boop"
}

async fn root_options() -> impl IntoResponse {
    (StatusCode::OK, [(header::ALLOW, "GET, HEAD, OPTIONS")])
}

async fn upload_info() -> &'static str {
    "Accepted Content-Types: gzipped tarfile, zip file"
}

async fn upload_options() -> impl IntoResponse {
    (StatusCode::OK, [(header::ALLOW, "GET, POST, HEAD, OPTIONS")])
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Liveness of the broker connections and of each storage tier
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let (permanent, quarantine, rejected) = tokio::join!(
        state.storage.up_check(StorageTier::Permanent),
        state.storage.up_check(StorageTier::Quarantine),
        state.storage.up_check(StorageTier::Rejected),
    );

    Json(StatusResponse {
        upload_service: "up",
        message_queue_producer: up_down(state.status.producer_connected()),
        message_queue_consumer: up_down(state.status.consumer_connected()),
        long_term_storage: up_down(permanent),
        quarantine_storage: up_down(quarantine),
        rejected_storage: up_down(rejected),
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn rejection_response(rejection: &UploadRejection) -> Response {
    metrics::counter!("upload.requests.rejected").increment(1);
    let status =
        StatusCode::from_u16(rejection.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorResponse {
            error: rejection.to_string(),
            code: rejection.code().to_string(),
        }),
    )
        .into_response()
}

/// Read the `upload` part, skipping any other fields
async fn read_upload_field(multipart: &mut Multipart) -> Result<Option<UploadedFile>, Response> {
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Ok(None),
            Err(e) => return Err(multipart_error(&e)),
        };

        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        let body = field
            .bytes()
            .await
            .map_err(|e| multipart_error(&e))?;

        return Ok(Some(UploadedFile { content_type, body }));
    }
}

fn multipart_error(e: &MultipartError) -> Response {
    metrics::counter!("upload.requests.rejected").increment(1);
    warn!(error = %e, "Failed to read multipart body");

    let status = e.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "PAYLOAD_TOO_LARGE"
    } else {
        "MULTIPART_ERROR"
    };
    (
        status,
        Json(ErrorResponse {
            error: e.body_text(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

/// Accept an archive upload and stage it for quarantine
#[instrument(skip_all, fields(payload_id, tracking_id))]
async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let content_length = header_value(&headers, header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let payload_id = header_value(&headers, PAYLOAD_ID_HEADER);
    let tracking_id = header_value(&headers, TRACKING_ID_HEADER);

    tracing::Span::current()
        .record("payload_id", payload_id.as_deref().unwrap_or("none"))
        .record("tracking_id", tracking_id.as_deref().unwrap_or("null"));

    // Refuse oversize uploads before reading any of the body
    if let Err(rejection) = check_declared_size(content_length, state.ingestor.max_length()) {
        warn!(error = %rejection, "Upload rejected");
        return rejection_response(&rejection);
    }

    let file = match multipart {
        Ok(mut multipart) => match read_upload_field(&mut multipart).await {
            Ok(file) => file,
            Err(response) => return response,
        },
        Err(e) => {
            warn!(error = %e, "Request body is not multipart");
            None
        }
    };

    let request = UploadRequest {
        content_length,
        payload_id,
        tracking_id,
        identity_header: header_value(&headers, IDENTITY_HEADER),
        file,
    };

    match state.ingestor.accept(request).await {
        Ok(payload_id) => {
            metrics::counter!("upload.requests.accepted").increment(1);
            info!(payload_id = %payload_id, "Upload accepted");
            StatusCode::ACCEPTED.into_response()
        }
        Err(rejection) => {
            warn!(error = %rejection, "Upload rejected");
            rejection_response(&rejection)
        }
    }
}

/// Start the upload API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, prefix = %config.path_prefix, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
