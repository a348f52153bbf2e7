//! Bounded readiness polling
//!
//! Every wait in a bring-up (DHCP lease, SSH, node Ready, pod Ready, CSR
//! present) goes through [`poll`]. Each attempt classifies what it saw as
//! [`Check::Ready`], [`Check::NotYet`] or [`Check::Fatal`]; only `NotYet` is
//! retried, and only up to `max_attempts` times.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use dpusim::poll::{poll, Check, PollConfig};
//!
//! # async fn demo() {
//! let cfg = PollConfig::new(Duration::from_secs(2), 30);
//! let addr = poll(&cfg, "management address", || async {
//!     Check::<String>::NotYet
//! })
//! .await;
//! assert!(addr.is_err());
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Outcome of a single readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check<T> {
    /// Condition met, carrying the observed value
    Ready(T),
    /// Condition not met yet, worth asking again
    NotYet,
    /// Condition can never be met, stop immediately
    Fatal(String),
}

impl<T> Check<T> {
    /// Map the common `Result<Option<T>>` lookup shape onto the tri-state
    ///
    /// `Ok(Some)` is ready, `Ok(None)` is not yet, `Err` is fatal.
    pub fn from_result<E: std::fmt::Display>(result: Result<Option<T>, E>) -> Self {
        match result {
            Ok(Some(value)) => Check::Ready(value),
            Ok(None) => Check::NotYet,
            Err(e) => Check::Fatal(e.to_string()),
        }
    }
}

/// Interval and attempt budget for one wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PollConfig {
    /// Sleep between attempts
    #[serde(deserialize_with = "secs::deserialize")]
    pub interval: Duration,
    /// Total number of checks before giving up
    pub max_attempts: u32,
}

impl PollConfig {
    /// Create a poll configuration
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound on the time spent sleeping in one wait
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Why a wait ended without a value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    /// Every attempt returned [`Check::NotYet`]
    #[error("timed out waiting for {what} after {attempts} attempts")]
    TimedOut {
        /// What was being waited for
        what: String,
        /// Attempts made
        attempts: u32,
    },
    /// The check reported an unrecoverable condition
    #[error("gave up waiting for {what}: {reason}")]
    Fatal {
        /// What was being waited for
        what: String,
        /// Reason given by the check
        reason: String,
    },
}

impl PollError {
    /// True when the wait ran out of attempts rather than hitting a fatal check
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::TimedOut { .. })
    }
}

/// Call `check` until it is ready, fatal, or `max_attempts` is exhausted.
///
/// Sleeps `interval` between attempts, never after the last one. A
/// `max_attempts` of zero is treated as one attempt.
pub async fn poll<T, F, Fut>(cfg: &PollConfig, what: &str, mut check: F) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Check<T>>,
{
    let attempts = cfg.max_attempts.max(1);

    for attempt in 1..=attempts {
        match check().await {
            Check::Ready(value) => return Ok(value),
            Check::Fatal(reason) => {
                return Err(PollError::Fatal {
                    what: what.to_string(),
                    reason,
                })
            }
            Check::NotYet => {
                debug!(what = %what, attempt, max_attempts = attempts, "not ready yet");
                if attempt < attempts {
                    tokio::time::sleep(cfg.interval).await;
                }
            }
        }
    }

    Err(PollError::TimedOut {
        what: what.to_string(),
        attempts,
    })
}

pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Read a duration written as (fractional) seconds
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
