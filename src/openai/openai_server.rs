use super::requests::ChatRequest;
use super::responses::{APIError, ChatResponder, HealthResponse};
use crate::api::ChatService;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

pub const SESSION_HEADER: &str = "x-session-id";
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal server error occurred.";

pub fn build_router(service: ChatService) -> Router {
    let session_header = HeaderName::from_static(SESSION_HEADER);
    let cors_layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, session_header.clone()])
        .expose_headers([session_header])
        .allow_origin(Any); // same as "*"

    Router::new()
        .route("/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .layer(cors_layer)
        .with_state(service)
}

async fn health_handler(State(service): State<ChatService>) -> ChatResponder {
    ChatResponder::Health(HealthResponse::new(service.health()))
}

/// `POST /chat`. The session is chosen by the `x-session-id` header; a new
/// one is started (and returned in the same header) when it is absent.
async fn chat_handler(
    State(service): State<ChatService>,
    headers: HeaderMap,
    body: Option<Json<ChatRequest>>,
) -> Response {
    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let Some(message) = body
        .as_ref()
        .and_then(|Json(req)| req.message())
        .map(|m| m.to_string())
    else {
        warn!("Rejecting chat request without a message - session_id={session_id}");
        return with_session(
            &session_id,
            ChatResponder::ValidationError(APIError::new_str("No message provided")),
        );
    };

    info!("Chat request received - session_id={session_id}");
    let responder = match service.chat(&session_id, message).await {
        Ok(outcome) => ChatResponder::Completion(outcome),
        Err(_) => ChatResponder::InternalError(APIError::new_str(INTERNAL_ERROR_MESSAGE)),
    };
    with_session(&session_id, responder)
}

fn with_session(session_id: &str, responder: ChatResponder) -> Response {
    match HeaderValue::from_str(session_id) {
        Ok(value) => ([(HeaderName::from_static(SESSION_HEADER), value)], responder).into_response(),
        Err(_) => responder.into_response(),
    }
}
