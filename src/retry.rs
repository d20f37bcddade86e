//! Retry Policy
//!
//! One backoff policy shared by the connection manager and the dispatcher.
//! Errors pick a profile by kind: transport failures and timeouts use the
//! short `network` profile, suspended compute uses the long `wake` profile,
//! and every other kind fails immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::error::{GatewayError, Result};

/// Exponential backoff parameters for one class of failure
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffProfile {
    /// Attempts allowed for this class, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f32,
    /// Relative jitter applied to each delay, in `[0, 1]`
    pub jitter_factor: f32,
    /// Upper bound on the summed delays for this class
    pub max_total_wait_ms: u64,
}

impl BackoffProfile {
    /// Short profile for network blips
    #[must_use]
    pub const fn network() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            max_total_wait_ms: 15_000,
        }
    }

    /// Long profile for compute that has to be woken up
    #[must_use]
    pub const fn wake() -> Self {
        Self {
            max_attempts: 40,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 15_000,
            backoff_multiplier: 1.5,
            jitter_factor: 0.2,
            max_total_wait_ms: 300_000,
        }
    }

    /// A profile that never retries
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            max_total_wait_ms: 0,
        }
    }

    /// Read `<prefix>_max_attempts`, `<prefix>_initial_ms`, `<prefix>_max_backoff_ms`
    /// and `<prefix>_max_wait_ms`, keeping `fallback` for anything unset
    #[must_use]
    pub fn from_config(config: &ResolvedConfig, prefix: &str, fallback: Self) -> Self {
        let read = |suffix: &str| config.get_u64(&format!("{prefix}_{suffix}"));
        Self {
            max_attempts: read("max_attempts")
                .map_or(fallback.max_attempts, |n| u32::try_from(n).unwrap_or(u32::MAX)),
            initial_backoff_ms: read("initial_ms").unwrap_or(fallback.initial_backoff_ms),
            max_backoff_ms: read("max_backoff_ms").unwrap_or(fallback.max_backoff_ms),
            max_total_wait_ms: read("max_wait_ms").unwrap_or(fallback.max_total_wait_ms),
            ..fallback
        }
    }

    /// Delay before retry number `retry` (0-based), jitter included
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let pow = self.backoff_multiplier.powi(i32::try_from(retry).unwrap_or(i32::MAX));
        let delay_ms = ((self.initial_backoff_ms as f32 * pow) as u64).min(self.max_backoff_ms);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter > 0.0 && delay_ms > 0 {
            let scale: f32 = rand::rng().random_range(-jitter..=jitter);
            let jitter_ms = (delay_ms as f32 * scale).round() as i64;
            let adjusted = (delay_ms as i64 + jitter_ms).max(0) as u64;
            return Duration::from_millis(adjusted);
        }

        Duration::from_millis(delay_ms)
    }

    fn max_total_wait(&self) -> Duration {
        Duration::from_millis(self.max_total_wait_ms)
    }
}

/// Which profile an error is retried under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Network,
    Wake,
}

impl RetryClass {
    /// Retry class for an error, `None` when the error must surface immediately
    #[must_use]
    pub const fn of(err: &GatewayError) -> Option<Self> {
        match err {
            GatewayError::Connection(_) | GatewayError::Timeout(_) => Some(Self::Network),
            GatewayError::SuspendedResource(_) => Some(Self::Wake),
            _ => None,
        }
    }
}

/// Backoff policy parameterised per error kind
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub network: BackoffProfile,
    pub wake: BackoffProfile,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { network: BackoffProfile::network(), wake: BackoffProfile::wake() }
    }
}

#[derive(Default)]
struct Spent {
    failures: u32,
    waited: Duration,
}

impl RetryPolicy {
    /// Policy from the `network_retry_*` and `wake_retry_*` config fields
    #[must_use]
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            network: BackoffProfile::from_config(config, "network_retry", BackoffProfile::network()),
            wake: BackoffProfile::from_config(config, "wake_retry", BackoffProfile::wake()),
        }
    }

    /// Policy that surfaces every error on the first failure
    #[must_use]
    pub const fn none() -> Self {
        Self { network: BackoffProfile::disabled(), wake: BackoffProfile::disabled() }
    }

    /// Same profiles with attempts capped at `max_attempts`
    #[must_use]
    pub fn limited(&self, max_attempts: u32) -> Self {
        let cap = |profile: &BackoffProfile| BackoffProfile {
            max_attempts: profile.max_attempts.min(max_attempts.max(1)),
            ..profile.clone()
        };
        Self { network: cap(&self.network), wake: cap(&self.wake) }
    }

    /// Profile an error would be retried under
    #[must_use]
    pub fn profile_for(&self, err: &GatewayError) -> Option<&BackoffProfile> {
        RetryClass::of(err).map(|class| match class {
            RetryClass::Network => &self.network,
            RetryClass::Wake => &self.wake,
        })
    }

    /// Drive `operation` until it succeeds or its error's profile is spent
    ///
    /// - `operation(attempt)`: one attempt (0-based across all classes).
    /// - `on_retry(&err, delay, next_attempt)`: called before each sleep.
    ///
    /// Attempts and waiting time are counted per profile, so a wake-up that
    /// is interrupted by a network blip does not burn the wake budget. When a
    /// profile runs out, the last error is returned unchanged.
    pub async fn run<T, Op, Fut, OnRetry>(&self, mut operation: Op, mut on_retry: OnRetry) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        OnRetry: FnMut(&GatewayError, Duration, u32),
    {
        let mut network = Spent::default();
        let mut wake = Spent::default();
        let mut attempt: u32 = 0;

        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let (profile, spent) = match RetryClass::of(&err) {
                Some(RetryClass::Network) => (&self.network, &mut network),
                Some(RetryClass::Wake) => (&self.wake, &mut wake),
                None => return Err(err),
            };

            spent.failures += 1;
            if spent.failures >= profile.max_attempts {
                debug!(attempt, kind = %err.kind(), "Retry attempts exhausted");
                return Err(err);
            }

            let remaining = profile.max_total_wait().saturating_sub(spent.waited);
            if remaining.is_zero() {
                debug!(attempt, kind = %err.kind(), "Retry wait budget exhausted");
                return Err(err);
            }

            let delay = profile.delay_for(spent.failures - 1).min(remaining);
            spent.waited += delay;

            let next_attempt = attempt + 1;
            debug!(
                attempt,
                next_attempt,
                kind = %err.kind(),
                delay_ms = delay.as_millis() as u64,
                "Retry backoff"
            );
            on_retry(&err, delay, next_attempt);
            tokio::time::sleep(delay).await;

            attempt = next_attempt;
        }
    }
}
