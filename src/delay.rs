//! Delay inputs and their normalisation to whole seconds.

use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How long a message should stay invisible before reaching its queue.
///
/// Every form normalises to a whole number of seconds; sub-second remainders
/// are truncated. Relative delays that are zero or negative mean "publish now".
/// An absolute time that has already passed is rejected instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delay {
    Seconds(i64),
    Duration(Duration),
    FractionalSeconds(f64),
    Until(DateTime<Utc>),
}

impl Delay {
    pub fn from_secs(seconds: i64) -> Self {
        Delay::Seconds(seconds)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Delay::Duration(duration)
    }

    pub fn from_secs_f64(seconds: f64) -> Self {
        Delay::FractionalSeconds(seconds)
    }

    pub fn until(instant: DateTime<Utc>) -> Self {
        Delay::Until(instant)
    }

    /// Whole seconds of delay measured from now.
    pub fn whole_seconds(&self) -> Result<u64> {
        self.whole_seconds_at(Utc::now())
    }

    /// Whole seconds of delay measured from `now`.
    pub fn whole_seconds_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let seconds = match *self {
            Delay::Seconds(seconds) => u64::try_from(seconds).unwrap_or(0),
            Delay::Duration(duration) => duration.as_secs(),
            Delay::FractionalSeconds(seconds) => {
                if !seconds.is_finite() {
                    return Err(QueueError::InvalidDelay(format!("{} is not a finite number of seconds", seconds)));
                }
                if seconds <= 0.0 {
                    0
                } else if seconds >= u64::MAX as f64 {
                    return Err(QueueError::InvalidDelay(format!("{} seconds is out of range", seconds)));
                } else {
                    seconds.trunc() as u64
                }
            }
            Delay::Until(instant) => {
                if instant < now {
                    return Err(QueueError::InvalidDelay(format!(
                        "{} is already in the past",
                        instant.to_rfc3339()
                    )));
                }
                u64::try_from((instant - now).num_seconds()).unwrap_or(0)
            }
        };

        ttl_millis(seconds)?;
        Ok(seconds)
    }
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::Duration(duration)
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(instant: DateTime<Utc>) -> Self {
        Delay::Until(instant)
    }
}

/// `x-message-ttl` for a holding queue, bounded to what an AMQP signed long
/// long can carry.
pub(crate) fn ttl_millis(seconds: u64) -> Result<u64> {
    seconds
        .checked_mul(1000)
        .filter(|millis| i64::try_from(*millis).is_ok())
        .ok_or_else(|| QueueError::InvalidDelay(format!("{} seconds overflows the message TTL", seconds)))
}

/// Name of the holding queue (and its exchange) for `destination` and `seconds`.
pub fn delayed_queue_name(destination: &str, seconds: u64) -> String {
    format!("{}_deferred_{}", destination, seconds)
}
