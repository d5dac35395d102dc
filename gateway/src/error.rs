use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use slipstream_core::GatewayError;

/// HTTP rendering of [`GatewayError`].
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": {
                "message": self.0.to_string(),
                "kind": self.0.kind(),
            }
        });
        if let GatewayError::CreditsExhausted {
            available,
            next_recovery_min,
        } = &self.0
        {
            body["credits"] = json!({ "available": available });
            if let Some(minutes) = next_recovery_min {
                body["nextRecoveryIn"] = json!(format!("~{minutes}min"));
            }
        }
        (status, Json(body)).into_response()
    }
}
