//! Fixed-budget polling
//!
//! Every wait in the control plane is a fixed number of observations with a
//! fixed delay between them. No jitter and no backoff growth: the budgets are
//! tuned per wait and an operator retrying a failed run expects the same
//! timing again.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Attempt budget and delay for one kind of wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    pub attempts: u32,
    /// Delay between observations, in milliseconds
    pub delay_ms: u64,
}

impl PollPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Snapshot readiness: 60 attempts, 5 seconds apart
    pub const fn snapshot_ready() -> Self {
        Self::new(60, Duration::from_secs(5))
    }

    /// Bulk copy completion: 240 attempts, 30 seconds apart
    pub const fn rsync_completion() -> Self {
        Self::new(240, Duration::from_secs(30))
    }

    /// Replication health: 12 attempts, 10 seconds apart
    pub const fn replication_health() -> Self {
        Self::new(12, Duration::from_secs(10))
    }
}

/// A polling budget was exhausted
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{what} not reached after {attempts} attempts")]
pub struct Timeout {
    pub what: String,
    pub attempts: u32,
}

impl Timeout {
    pub fn new(what: impl Into<String>, attempts: u32) -> Self {
        Self {
            what: what.into(),
            attempts,
        }
    }
}

/// Poll `observe` until it yields a value or the budget runs out
///
/// `observe` receives the 1-based attempt number and returns `Ok(Some(_))`
/// when the target state was seen, `Ok(None)` to keep waiting, or an error
/// to stop immediately. Exactly `policy.attempts` observations are made when
/// the target never appears; there is no sleep after the last one.
pub async fn poll_until<T, E, F, Fut>(policy: &PollPolicy, what: &str, mut observe: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: From<Timeout>,
{
    for attempt in 1..=policy.attempts {
        if let Some(value) = observe(attempt).await? {
            debug!(what, attempt, "Poll target reached");
            return Ok(value);
        }
        debug!(what, attempt, max = policy.attempts, "Poll target not reached yet");
        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay()).await;
        }
    }
    Err(Timeout::new(what, policy.attempts).into())
}
