use std::net::SocketAddr;

use axum::extract::{DefaultBodyLimit, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod admin;
pub mod chat;
pub mod platform;
pub mod soc;
pub mod user;

/// RPC bodies can carry whole-file context; cap well above the JSON limit.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(user::health))
        .route("/v1/models", get(user::models))
        .route("/v1/credits", get(user::credits))
        .route("/v1/session-credits", get(admin::session_credits))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/admin/accounts/status", get(admin::accounts_status))
        .route("/admin/accounts/reload", post(admin::accounts_reload))
        .route(
            "/admin/accounts/health-check",
            post(admin::accounts_health_check),
        )
        .route("/admin/sessions/status", get(admin::sessions_status))
        .route("/admin/sessions/register", post(admin::sessions_register))
        .route("/admin/sessions/reload", post(admin::sessions_reload))
        .route("/admin/sessions/remove", post(admin::sessions_remove))
        .route(
            "/admin/sessions/health-check",
            post(admin::sessions_health_check),
        )
        .route("/admin/users/status", get(admin::users_status))
        .route("/admin/users/create", post(admin::users_create))
        .route("/admin/users/update", post(admin::users_update))
        .route("/admin/users/delete", post(admin::users_delete))
        .route(
            "/admin/users/reset-credits",
            post(admin::users_reset_credits),
        )
        .route("/admin/users/reload", post(admin::users_reload))
        .route("/admin/bandwidth", get(admin::bandwidth))
        .route("/soc/events", get(soc::events))
        .route("/soc/alerts", get(soc::alerts))
        // the platform RPC surface: POST /exa.<service>/<method>
        .route("/:service/:method", post(platform::passthrough))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Remote client address. Present when the server was started with
/// `into_make_service_with_connect_info`; unit tests driving the router
/// directly fall back to loopback.
#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub SocketAddr);

impl ClientIp {
    pub fn ip_string(&self) -> String {
        self.0.ip().to_string()
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(info) = parts
            .extensions
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
        {
            return Ok(ClientIp(info.0));
        }
        Ok(ClientIp(SocketAddr::from(([127, 0, 0, 1], 0))))
    }
}

/// Pull the bearer value out of an `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    #[test]
    fn bearer_extraction_tolerates_case_and_whitespace() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer tok-123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok-123"));

        headers.insert(AUTHORIZATION, "bearer  spaced ".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("spaced"));

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
