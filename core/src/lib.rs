//! Shared primitives for the slipstream gateway workspace.
//!
//! This crate carries the pieces every other member needs: the immutable
//! startup configuration, the user-facing error taxonomy with its HTTP
//! mapping, tracing bootstrap, and the credential-masking helpers that keep
//! raw secrets out of logs and admin views.

pub mod config;
pub mod error;
pub mod logging;
pub mod mask;

pub use config::{load_gateway, load_intercept, ConfigOverrides, GatewayConfig, InterceptConfig};
pub use error::GatewayError;
pub use logging::{init_tracing, LogFormat};
pub use mask::{mask_secret, token_fingerprint};
