use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Local, NaiveTime};
use slipstream_pool::{AccountStore, SessionStore};
use slipstream_quota::UserStore;
use tracing::{info, warn};

/// Time until the next local midnight.
fn until_local_midnight() -> std::time::Duration {
    let now = Local::now();
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is a valid time");
    let tomorrow = (now + ChronoDuration::days(1))
        .date_naive()
        .and_time(midnight);
    let target = tomorrow
        .and_local_timezone(Local)
        .earliest()
        .unwrap_or_else(|| now.naive_local().and_utc().into());
    (target - now)
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(60))
}

/// Daily reset at local midnight: per-user consumed credits, per-account
/// token counters, and sessions whose only disable reason was the daily
/// quota. A failed tick is logged and retried the next day.
pub fn spawn_daily_reset(
    sessions: Arc<SessionStore>,
    accounts: Arc<AccountStore>,
    users: Arc<UserStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let wait = until_local_midnight();
            info!(in_secs = wait.as_secs(), "daily reset scheduled");
            tokio::time::sleep(wait).await;

            let sessions_reenabled = sessions.reset_daily();
            let accounts_reenabled = accounts.reset_daily();
            users.reset_daily();
            info!(
                sessions_reenabled,
                accounts_reenabled, "daily reset applied"
            );

            if let Err(err) = sessions.save() {
                warn!(%err, "daily reset: failed to persist sessions");
            }
            if let Err(err) = accounts.save() {
                warn!(%err, "daily reset: failed to persist accounts");
            }
            if let Err(err) = users.save() {
                warn!(%err, "daily reset: failed to persist users");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn midnight_is_at_most_a_day_away() {
        let wait = until_local_midnight();
        assert!(wait <= std::time::Duration::from_secs(24 * 3600));
        assert!(wait > std::time::Duration::ZERO);
    }
}
