use thiserror::Error;

/// User-facing failure taxonomy for the gateway data plane.
///
/// Each kind carries the HTTP status it maps to; bodies are rendered by the
/// HTTP layer as `{"error": {"message": ...}}` plus kind-specific extras.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("credits exhausted")]
    CreditsExhausted {
        available: f64,
        /// Minutes until the next scheduled recovery, when known.
        next_recovery_min: Option<i64>,
    },
    #[error("no active subscription")]
    NoSubscription,
    #[error("no available account")]
    NoAvailableAccount,
    #[error("upstream error ({status}): {body}")]
    UpstreamError { status: u16, body: String },
    #[error("upstream timeout")]
    UpstreamTimeout,
    #[error("platform error: {0}")]
    PlatformError(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("not found")]
    NotFound,
    #[error("proxy processing error: {0}")]
    ProxyProcessing(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Upstream bodies quoted in error messages are cut to this length.
pub const UPSTREAM_BODY_SNIPPET: usize = 200;

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Unauthorized(_) => 401,
            GatewayError::RateLimited | GatewayError::CreditsExhausted { .. } => 429,
            GatewayError::NoSubscription => 403,
            GatewayError::NoAvailableAccount => 503,
            // The RPC pass-through relays upstream statuses verbatim as
            // responses; reaching this error means the exchange itself
            // failed, which is a bad gateway.
            GatewayError::UpstreamError { .. } => 502,
            GatewayError::UpstreamTimeout => 504,
            GatewayError::PlatformError(_) => 502,
            GatewayError::BadRequest(_) | GatewayError::InvalidJson(_) => 400,
            GatewayError::PayloadTooLarge => 413,
            GatewayError::NotFound => 404,
            GatewayError::ProxyProcessing(_) | GatewayError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable kind, used in event records and alerting.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::CreditsExhausted { .. } => "credits_exhausted",
            GatewayError::NoSubscription => "no_subscription",
            GatewayError::NoAvailableAccount => "no_available_account",
            GatewayError::UpstreamError { .. } => "upstream_error",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::PlatformError(_) => "platform_error",
            GatewayError::BadRequest(_) => "bad_request",
            GatewayError::PayloadTooLarge => "payload_too_large",
            GatewayError::InvalidJson(_) => "invalid_json",
            GatewayError::NotFound => "not_found",
            GatewayError::ProxyProcessing(_) => "proxy_processing_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Truncate an upstream body for inclusion in an error message.
    pub fn snippet(body: &str) -> String {
        if body.len() <= UPSTREAM_BODY_SNIPPET {
            body.to_string()
        } else {
            let mut end = UPSTREAM_BODY_SNIPPET;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body[..end].to_string()
        }
    }
}
