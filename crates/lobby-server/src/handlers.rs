use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lobby_core::{LobbyError, SessionSummary};
use lobby_engine::{HostRequest, HostResponse};
use serde_json::json;

use crate::server::AppState;

/// A `LobbyError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub LobbyError);

impl From<LobbyError> for ApiError {
    fn from(e: LobbyError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = json!({
            "error": {
                "code": self.0.error_kind(),
                "message": self.0.to_string(),
                "retryable": self.0.is_retryable(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// `POST /host`. The body is parsed as JSON whatever its content type,
/// since browser `fetch` calls often send it as `text/plain`.
pub async fn host_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<HostResponse>, ApiError> {
    let request: HostRequest = serde_json::from_slice(&body)
        .map_err(|e| LobbyError::InvalidRequest(format!("malformed host request: {e}")))?;
    let response = state.host.host(request)?;
    Ok(Json(response))
}

/// `GET /sessions`, oldest first.
pub async fn sessions_handler(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.discovery.list())
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "status": "healthy",
        "sessions": state.registry.len(),
        "connections": state.connections.count(),
        "lifecycle": state.stats.counters(),
    });
    (StatusCode::OK, Json(body))
}
