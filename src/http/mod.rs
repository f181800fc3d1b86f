use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        DefaultBodyLimit, Extension, FromRequest, Path, Query, Request, rejection::JsonRejection,
    },
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::{
    blob::{BlobError, DiskBlobStore},
    config::Config,
    domain::{
        DomainError, Fund, GALLERY_FILTER_ALL, GalleryImage, GalleryInput, GalleryView,
        GuestbookEntry, GuestbookInput, Pledge,
    },
    pledge::{PledgeEngine, PledgeError, PledgeRejection, PledgeRequest},
    reconcile::{Loaded, Reconciler, SyncError},
    store::StoreError,
};

/// JSON bodies carry inline images of up to 5 MiB, base64 encoded.
pub const MAX_REQUEST_BODY_BYTES: usize = 12 * 1024 * 1024;

const UNAVAILABLE_MESSAGE: &str = "We couldn't reach the server right now. Please try again.";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub pledges: Arc<PledgeEngine>,
    /// Present when uploads are kept on disk and served from `/blobs`.
    pub disk_blobs: Option<Arc<DiskBlobStore>>,
}

#[derive(Debug)]
pub struct ApiError {
    code: &'static str,
    message: String,
    status: StatusCode,
    details: Map<String, Value>,
}

impl ApiError {
    fn new(code: &'static str, status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status,
            details: Map::new(),
        }
    }

    fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request", StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", StatusCode::NOT_FOUND, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("forbidden", StatusCode::FORBIDDEN, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new("payload_too_large", StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn unavailable() -> Self {
        Self::new(
            "unavailable",
            StatusCode::SERVICE_UNAVAILABLE,
            UNAVAILABLE_MESSAGE,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<DomainError> for ApiError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::FundNotFound { .. } => ApiError::not_found(value.to_string()),
            DomainError::MissingField { field } => {
                ApiError::invalid_request(value.to_string()).with_detail("field", field)
            }
            _ => ApiError::invalid_request(value.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(domain) => domain.into(),
            StoreError::NotFound { .. } => ApiError::not_found(value.to_string()),
            StoreError::Rejected { reason, .. } => ApiError::invalid_request(reason),
            StoreError::Unavailable { .. } => {
                warn!(error = %value, "backend unavailable");
                ApiError::unavailable()
            }
            StoreError::Unsupported { .. }
            | StoreError::Io(_)
            | StoreError::SerdeJson(_)
            | StoreError::Sqlite(_)
            | StoreError::SchemaVersionMismatch { .. } => {
                error!(error = %value, "backend failure");
                ApiError::unavailable()
            }
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(value: BlobError) -> Self {
        match value {
            BlobError::PayloadTooLarge { size, limit } => {
                ApiError::payload_too_large(value.to_string())
                    .with_detail("size", size)
                    .with_detail("limit", limit)
            }
            BlobError::InvalidDataUrl { .. } => ApiError::invalid_request(value.to_string()),
            BlobError::NotFound { .. } => ApiError::not_found("not found"),
            BlobError::InvalidSignature | BlobError::Expired => {
                ApiError::forbidden(value.to_string())
            }
            BlobError::Io(_) => {
                error!(error = %value, "blob io failure");
                ApiError::internal("unable to read or store the image")
            }
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(value: SyncError) -> Self {
        match value {
            SyncError::Domain(e) => e.into(),
            SyncError::Store(e) => e.into(),
            SyncError::Blob(e) => e.into(),
        }
    }
}

impl From<PledgeError> for ApiError {
    fn from(value: PledgeError) -> Self {
        match value {
            PledgeError::Rejected(PledgeRejection::InvalidAmount(e)) => e.into(),
            PledgeError::Rejected(rejection @ PledgeRejection::FundNotFound { .. }) => {
                ApiError::not_found(rejection.to_string())
            }
            PledgeError::Store(e) => e.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    details: Map<String, Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code.to_string(),
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| match e.status() {
                StatusCode::PAYLOAD_TOO_LARGE => ApiError::payload_too_large(e.body_text())
                    .with_detail("limit", MAX_REQUEST_BODY_BYTES),
                _ => ApiError::invalid_request(e.body_text()),
            })?;
        Ok(Self(value))
    }
}

pub fn build_router(config: &Config, state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/funds", get(list_funds))
        .route("/pledge", post(create_pledge))
        .route("/guestbook", get(list_guestbook).post(create_guestbook_entry))
        .route("/gallery", get(list_gallery).post(create_gallery_image))
        .route("/blobs/*key", get(get_blob))
        .fallback(fallback_not_found);

    let mut app = if config.api_prefix.is_empty() {
        api
    } else {
        Router::new()
            .nest(&config.api_prefix, api)
            .fallback(fallback_not_found)
    };

    if let Some(origin) = config.cors_origin() {
        match HeaderValue::from_str(origin) {
            Ok(origin) => {
                app = app.layer(
                    CorsLayer::new()
                        .allow_origin(origin)
                        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                        .allow_headers([header::CONTENT_TYPE]),
                );
            }
            Err(_) => warn!(origin, "ignoring invalid cors origin"),
        }
    }

    app.layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(Extension(state))
}

async fn health(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": crate::version::VERSION,
        "sync_mode": state.reconciler.mode().as_str(),
    }))
}

fn loaded_json<T>(result: Loaded<T>) -> Result<Json<Vec<T>>, ApiError> {
    match result {
        Loaded::Fresh { items, .. } => Ok(Json(items)),
        Loaded::Unavailable => Err(ApiError::unavailable()),
    }
}

async fn list_funds(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<Fund>>, ApiError> {
    loaded_json(state.reconciler.load_funds().await)
}

#[derive(Debug, Deserialize)]
struct PledgeBody {
    #[serde(default)]
    fund_id: Option<String>,
    #[serde(default)]
    amount: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct PledgeResponse {
    fund: Fund,
    redirect_url: String,
    pledge: Pledge,
}

async fn create_pledge(
    Extension(state): Extension<AppState>,
    ApiJson(body): ApiJson<PledgeBody>,
) -> Result<Json<PledgeResponse>, ApiError> {
    let fund_id = body.fund_id.unwrap_or_default();
    if fund_id.trim().is_empty() {
        return Err(DomainError::MissingField { field: "fund_id" }.into());
    }
    if body.amount.is_null() {
        return Err(DomainError::MissingField { field: "amount" }.into());
    }

    let request = PledgeRequest {
        fund_id,
        amount: body.amount,
        name: body.name,
        message: body.message,
    };
    let receipt = state
        .pledges
        .submit(state.reconciler.write_target(), request)
        .await?;

    Ok(Json(PledgeResponse {
        fund: state.reconciler.resolve_fund(receipt.fund),
        redirect_url: receipt.redirect_url,
        pledge: receipt.pledge,
    }))
}

/// A guestbook entry plus the fallbacks the site renders for missing fields.
#[derive(Debug, Serialize)]
struct GuestbookCard {
    #[serde(flatten)]
    entry: GuestbookEntry,
    display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_alt: Option<String>,
}

impl From<GuestbookEntry> for GuestbookCard {
    fn from(entry: GuestbookEntry) -> Self {
        let display_name = entry.display_name().to_string();
        let display_alt = entry.display_alt().map(str::to_string);
        Self {
            entry,
            display_name,
            display_alt,
        }
    }
}

fn guestbook_cards(entries: Vec<GuestbookEntry>) -> Json<Vec<GuestbookCard>> {
    Json(entries.into_iter().map(GuestbookCard::from).collect())
}

async fn list_guestbook(
    Extension(state): Extension<AppState>,
) -> Result<Json<Vec<GuestbookCard>>, ApiError> {
    let Json(entries) = loaded_json(state.reconciler.load_guestbook().await)?;
    Ok(guestbook_cards(entries))
}

async fn create_guestbook_entry(
    Extension(state): Extension<AppState>,
    ApiJson(input): ApiJson<GuestbookInput>,
) -> Result<Json<Vec<GuestbookCard>>, ApiError> {
    let entries = state.reconciler.submit_guestbook(input).await?;
    Ok(guestbook_cards(entries))
}

#[derive(Debug, Deserialize)]
struct GalleryQuery {
    #[serde(default)]
    tag: Option<String>,
}

async fn list_gallery(
    Extension(state): Extension<AppState>,
    Query(query): Query<GalleryQuery>,
) -> Result<Json<Vec<GalleryImage>>, ApiError> {
    let Json(images) = loaded_json(state.reconciler.load_gallery().await)?;
    match query.tag.as_deref().map(str::trim) {
        Some(tag) if !tag.is_empty() && tag != GALLERY_FILTER_ALL => {
            let view = GalleryView::new(images);
            Ok(Json(view.filter(tag).into_iter().cloned().collect()))
        }
        _ => Ok(Json(images)),
    }
}

async fn create_gallery_image(
    Extension(state): Extension<AppState>,
    ApiJson(input): ApiJson<GalleryInput>,
) -> Result<Json<Vec<GalleryImage>>, ApiError> {
    let images = state.reconciler.submit_gallery(input).await?;
    Ok(Json(images))
}

#[derive(Debug, Deserialize)]
struct BlobQuery {
    expires: Option<i64>,
    sig: Option<String>,
}

async fn get_blob(
    Extension(state): Extension<AppState>,
    Path(key): Path<String>,
    Query(query): Query<BlobQuery>,
) -> Result<Response, ApiError> {
    let Some(blobs) = state.disk_blobs.as_ref() else {
        return Err(ApiError::not_found("not found"));
    };
    let (Some(expires), Some(sig)) = (query.expires, query.sig) else {
        return Err(BlobError::InvalidSignature.into());
    };
    blobs.signer().verify(&key, expires, &sig, Utc::now())?;

    let blob = blobs.read(&key).await?;
    let content_type = HeaderValue::from_str(&blob.content_type)
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=300")),
        ],
        blob.bytes,
    )
        .into_response())
}

async fn fallback_not_found() -> ApiError {
    ApiError::not_found("not found")
}

#[cfg(test)]
mod tests;
