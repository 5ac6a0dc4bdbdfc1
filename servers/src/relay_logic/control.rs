//! # HTTP Control Plane
//!
//! Subscriber lifecycle and runtime configuration over plain JSON/HTTP.
//! Event routing never goes through here; publishers and subscribers talk
//! to their queues directly.

use crate::relay_logic::config::Config;
use crate::relay_logic::model::{
    ConfigUpdateRequest, PositionRequest, PublisherResponse, RegistrationResponse, ReloadResponse, TopicsRequest,
};
use crate::relay_logic::state::AppState;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use lib_relay::configs::ConfigEntry;
use lib_relay::{Position, RelayError, SubscriberRecord};
use serde_json::json;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

/// # Application Error
///
/// Maps library errors and rejected request bodies onto HTTP responses with
/// a JSON body `{ "error_type", "message" }`.
#[derive(Debug)]
pub enum AppError {
    Relay(RelayError),
    BadRequest(String),
}

impl From<RelayError> for AppError {
    fn from(e: RelayError) -> Self {
        AppError::Relay(e)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, "InvalidRequestBody", message),
            AppError::Relay(e) => {
                let (status, error_type) = match &e {
                    RelayError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
                    RelayError::AlreadyExists(_) => (StatusCode::CONFLICT, "AlreadyExists"),
                    RelayError::MalformedEvent(_) => (StatusCode::BAD_REQUEST, "MalformedInput"),
                    RelayError::Config(_) => (StatusCode::BAD_REQUEST, "ConfigurationError"),
                    RelayError::RegistrationExhausted(_) => (StatusCode::INTERNAL_SERVER_ERROR, "RegistrationFailed"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "CollaboratorError"),
                };
                if status.is_server_error() {
                    log::error!("Control plane request failed: {}", e);
                } else {
                    log::warn!("Control plane request rejected: {}", e);
                }
                (status, error_type, e.to_string())
            }
        };
        (status, Json(json!({ "error_type": error_type, "message": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/subscriber", get(list_subscribers).put(register_subscriber))
        .route("/subscriber/{id}", get(get_subscriber).delete(deregister_subscriber))
        .route("/subscriber/{id}/position", post(update_position))
        .route("/subscriber/{id}/topic", put(add_topics).delete(remove_topics))
        .route("/publisher", get(publisher_queue))
        .route(
            "/configuration",
            get(get_configuration).post(reload_configuration).put(update_configuration),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: Config, app_state: AppState, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let app = router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    log::info!("Control plane listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Control plane shutting down.");
        })
        .await?;
    Ok(())
}

async fn root_handler() -> impl IntoResponse {
    "Occupancy relay is running"
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn list_subscribers(State(state): State<AppState>) -> ApiResult<Json<Vec<SubscriberRecord>>> {
    Ok(Json(state.registry.list().await?))
}

async fn register_subscriber(State(state): State<AppState>) -> ApiResult<Json<RegistrationResponse>> {
    let registration = state.registry.register().await?;
    Ok(Json(registration.into()))
}

async fn get_subscriber(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<SubscriberRecord>> {
    state
        .registry
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| RelayError::NotFound(format!("subscriber {}", id)).into())
}

async fn deregister_subscriber(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.registry.deregister(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn update_position(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<PositionRequest>, JsonRejection>,
) -> ApiResult<Json<SubscriberRecord>> {
    let Json(body) = payload?;
    let record = state.registry.update_position(&id, Position::new(body.x, body.y)).await?;
    Ok(Json(record))
}

async fn add_topics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TopicsRequest>, JsonRejection>,
) -> ApiResult<Json<SubscriberRecord>> {
    let Json(body) = payload?;
    Ok(Json(state.registry.add_topics(&id, body.topics).await?))
}

async fn remove_topics(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<TopicsRequest>, JsonRejection>,
) -> ApiResult<Json<SubscriberRecord>> {
    let Json(body) = payload?;
    Ok(Json(state.registry.remove_topics(&id, body.topics).await?))
}

async fn publisher_queue(State(state): State<AppState>) -> ApiResult<Json<PublisherResponse>> {
    let queue = state
        .thresholds()
        .snapshot()
        .inbound_queue
        .clone()
        .ok_or_else(|| RelayError::NotFound("inbound queue".into()))?;
    Ok(Json(PublisherResponse { queue_ref: queue.0 }))
}

async fn get_configuration(State(state): State<AppState>) -> ApiResult<Json<Vec<ConfigEntry>>> {
    Ok(Json(state.reloader.entries().await?))
}

async fn reload_configuration(State(state): State<AppState>) -> ApiResult<Json<ReloadResponse>> {
    let generation = state.reloader.reload_once().await?;
    Ok(Json(ReloadResponse { generation }))
}

async fn update_configuration(
    State(state): State<AppState>,
    payload: Result<Json<ConfigUpdateRequest>, JsonRejection>,
) -> ApiResult<Json<ReloadResponse>> {
    let Json(body) = payload?;
    let generation = state.reloader.update_field(&body.field_name, &body.field_value).await?;
    Ok(Json(ReloadResponse { generation }))
}
