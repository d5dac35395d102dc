//! Per-user quota engine: bearer authentication, the per-minute rate
//! limiter, model-weighted credit accounting and the asynchronous credit
//! recovery scheduler.

pub mod credit;
pub mod rate;
pub mod store;
pub mod user;

pub use credit::{detect_model, estimate_cost, known_models, recovery_tick_period};
pub use rate::RateLimiter;
pub use store::{spawn_recovery, CreditReceipt, UserStore};
pub use user::User;
