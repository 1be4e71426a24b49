//! Exponential backoff used both for polling long running operations and for
//! retrying provider calls that fail transiently.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidPolicy {
    #[error("Initial delay has to be greater than zero")]
    ZeroInitialDelay,

    #[error("At least one attempt is required")]
    ZeroAttempts,

    #[error("Max delay is shorter than the initial delay")]
    MaxDelayBelowInitial,
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error<E> {
    #[error("Gave up after {attempts} attempts (last reason: {})", .last_reason.as_deref().unwrap_or("none"))]
    Exhausted {
        attempts: u32,
        last_reason: Option<String>,
    },

    #[error(transparent)]
    Probe(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    max_attempts: u32,
    max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(
        initial_delay_ms: u64,
        max_attempts: u32,
        max_delay_ms: u64,
    ) -> Result<Self, InvalidPolicy> {
        if initial_delay_ms == 0 {
            return Err(InvalidPolicy::ZeroInitialDelay);
        }
        if max_attempts == 0 {
            return Err(InvalidPolicy::ZeroAttempts);
        }
        if max_delay_ms < initial_delay_ms {
            return Err(InvalidPolicy::MaxDelayBelowInitial);
        }

        Ok(Self {
            initial_delay: Duration::from_millis(initial_delay_ms),
            max_attempts,
            max_delay: Duration::from_millis(max_delay_ms),
        })
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// delay(n) = min(initial * 2^n, max)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);

        Duration::from_millis(initial.saturating_mul(factor).min(max))
    }

    /// Every delay the scheduler may wait for, indexed by attempt.
    pub fn delays(&self) -> Vec<Duration> {
        (0..self.max_attempts).map(|n| self.delay_for(n)).collect()
    }
}

/// What a probe reports back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe<T> {
    Ready(T),
    /// Not done yet; optionally says why so exhaustion can report it.
    Retry(Option<String>),
}

/// Handed to the probe on every invocation.
#[derive(Debug, Clone)]
pub struct BackoffAttempt {
    pub index: u32,
    pub delays: Arc<[Duration]>,
    pub elapsed: Duration,
}

impl BackoffAttempt {
    /// How long the scheduler slept before this attempt.
    pub fn waited(&self) -> Duration {
        match self.index {
            0 => Duration::ZERO,
            n => self.delays[n as usize - 1],
        }
    }

    /// How long the scheduler will sleep if this attempt asks to retry.
    pub fn next_delay(&self) -> Option<Duration> {
        let index = self.index as usize;
        if index + 1 < self.delays.len() {
            Some(self.delays[index])
        } else {
            None
        }
    }
}

/// Runs `probe` until it is ready, fails, or `policy.max_attempts` retries have
/// been spent. The first attempt fires immediately; attempt `n + 1` waits
/// `policy.delay_for(n)`.
pub async fn schedule_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    mut probe: F,
) -> Result<T, Error<E>>
where
    F: FnMut(BackoffAttempt) -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let delays: Arc<[Duration]> = policy.delays().into();
    let started = Instant::now();
    let mut last_reason = None;

    for index in 0..policy.max_attempts {
        if index > 0 {
            tokio::time::sleep(delays[index as usize - 1]).await;
        }

        let attempt = BackoffAttempt {
            index,
            delays: Arc::clone(&delays),
            elapsed: started.elapsed(),
        };

        match probe(attempt).await.map_err(Error::Probe)? {
            Probe::Ready(value) => return Ok(value),
            Probe::Retry(reason) => {
                log::debug!(
                    "Attempt {} of {} not ready{}",
                    index + 1,
                    policy.max_attempts,
                    reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default()
                );
                if reason.is_some() {
                    last_reason = reason;
                }
            }
        }
    }

    Err(Error::Exhausted {
        attempts: policy.max_attempts,
        last_reason,
    })
}

/// Formats a delay as `HH:MM:SS.mmm`.
pub fn format_delay(delay: Duration) -> String {
    let millis = delay.as_millis();
    let hours = millis / 3_600_000;
    let minutes = (millis / 60_000) % 60;
    let seconds = (millis / 1_000) % 60;

    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis % 1_000)
}
