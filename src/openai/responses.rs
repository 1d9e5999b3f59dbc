use crate::state::model_manager::HealthStatus;
use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

#[derive(Debug, Display, Error, Serialize)]
#[display(fmt = "Error: {}", data)]
pub struct APIError {
    data: String,
}

impl APIError {
    pub fn new(data: String) -> Self {
        Self { data }
    }

    pub fn new_str(data: &str) -> Self {
        Self {
            data: data.to_string(),
        }
    }

    pub fn from<T: ToString>(value: T) -> Self {
        Self::new(value.to_string())
    }

    pub fn message(&self) -> &str {
        &self.data
    }
}

#[macro_export]
macro_rules! try_api {
    ($candle_result:expr) => {
        match $candle_result {
            Ok(v) => v,
            Err(e) => {
                return Err(crate::openai::responses::APIError::from(e));
            }
        }
    };
}

/// Result of one generation call. Serializes to the chat endpoint's body,
/// e.g. `{"status":"success","response":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GenerationOutcome {
    Success { response: String },
    Aborted { message: String },
    Error { message: String },
}

impl GenerationOutcome {
    pub fn aborted(message: &str) -> Self {
        Self::Aborted {
            message: message.to_string(),
        }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Success { .. } => StatusCode::OK,
            Self::Aborted { .. } => client_closed_request(),
            Self::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Non-standard 499 used when the requester went away.
pub fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub data: HealthStatus,
}

impl HealthResponse {
    pub fn new(data: HealthStatus) -> Self {
        Self {
            status: "success".to_string(),
            data,
        }
    }
}

trait ErrorToResponse: Serialize {
    fn to_response(&self, code: StatusCode) -> axum::response::Response {
        let mut r = Json(self).into_response();
        *r.status_mut() = code;
        r
    }
}

#[derive(Serialize)]
struct JsonError {
    status: &'static str,
    message: String,
}

impl JsonError {
    fn new(message: String) -> Self {
        Self {
            status: "error",
            message,
        }
    }
}
impl ErrorToResponse for JsonError {}

pub enum ChatResponder {
    Completion(GenerationOutcome),
    Health(HealthResponse),
    InternalError(APIError),
    ValidationError(APIError),
}

impl IntoResponse for ChatResponder {
    fn into_response(self) -> axum::response::Response {
        match self {
            ChatResponder::Completion(outcome) => {
                let code = outcome.status_code();
                let mut r = Json(outcome).into_response();
                *r.status_mut() = code;
                r
            }
            ChatResponder::Health(health) => Json(health).into_response(),
            ChatResponder::InternalError(e) => JsonError::new(e.message().to_string())
                .to_response(StatusCode::INTERNAL_SERVER_ERROR),
            ChatResponder::ValidationError(e) => {
                JsonError::new(e.message().to_string()).to_response(StatusCode::BAD_REQUEST)
            }
        }
    }
}
