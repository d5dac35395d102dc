//! Session-pool data plane: harvested platform sessions and upstream
//! OpenAI-compatible accounts, their persistence, health lifecycle, token
//! refresh, and the affinity router that pins clients to sessions.

pub mod account;
pub mod adapter;
pub mod affinity;
pub mod health;
pub mod refresh;
pub mod session;
pub mod store;

pub use account::{AccountStore, UpstreamAccount};
pub use adapter::{AdapterRegistry, AdapterRequest, PlatformAdapter, WindsurfAdapter};
pub use affinity::{AffinityRouter, Binding};
pub use health::{MonitorConfig, ProbeOutcome};
pub use refresh::RefreshConfig;
pub use session::{DisabledReason, Session, SessionCredentials, SessionStatusView};
pub use store::{HealthThresholds, HealthTransition, SessionStore, StoreError};
