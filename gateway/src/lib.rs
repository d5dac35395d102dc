//! The central slipstream gateway.
//!
//! Terminates gateway-facing HTTPS, authenticates internal bearer users,
//! applies rate and credit policy, routes requests onto pooled platform
//! sessions or upstream accounts, and keeps the event/bandwidth telemetry
//! that the SOC surfaces read.

pub mod bandwidth;
pub mod error;
pub mod events;
pub mod reset;
pub mod routes;
pub mod state;
pub mod upstream;

pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
