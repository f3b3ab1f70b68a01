//! Retry policies.
//!
//! The executor consults the task's [`RetryPolicy`] once for every failed
//! attempt that is not an auth challenge. There is no framework retry cap;
//! the `attempt` counter handed to the policy is the only bound.

use crate::decision::Decision;
use crate::request::PreparedRequest;
use crate::taxonomy::ErrorKind;
use crate::task::Task;
use http::StatusCode;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay used by [`RetryStrategy::twice_with_default_delay`]
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Decides whether a failed attempt is retried.
pub trait RetryPolicy: fmt::Debug + Send + Sync + 'static {
    /// `attempt` counts the generic retries already performed for `task`
    /// (0 on the first failure). Auth retries are not counted.
    ///
    /// May complete `decision` synchronously or from any thread later on.
    /// Must not block the calling thread.
    fn should_retry(&self, task: &Task, error: &ErrorKind, attempt: u32, decision: Decision);
}

/// Exponential delay schedule: `base * factor^attempt`, capped at `cap`,
/// optionally stretched by up to 25% of random jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub factor: f64,
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    /// 100ms doubling up to 10s, with jitter
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl ExponentialBackoff {
    /// Doubling from `base` up to `cap`, with jitter
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            factor: 2.0,
            jitter: true,
        }
    }

    /// 1ms doubling up to 100ms, no jitter. Keeps tests fast and exact.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            jitter: false,
            ..Self::new(Duration::from_millis(1), Duration::from_millis(100))
        }
    }

    /// Starts sooner and backs off further than the default
    #[must_use]
    pub fn aggressive() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(30))
    }
}

/// Delay before generic retry number `attempt + 1`.
///
/// Never panics: a non-finite or negative factor counts as 1 and the result
/// is clamped to the cap (and to one day).
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: u32) -> Duration {
    const ONE_DAY_SECS: f64 = 86_400.0;

    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let factor = if backoff.factor.is_finite() && backoff.factor >= 0.0 {
        backoff.factor
    } else {
        1.0
    };
    let cap_secs = backoff.cap.as_secs_f64().min(ONE_DAY_SECS);

    let raw = backoff.base.as_secs_f64() * factor.powi(exponent);
    let secs = if raw.is_finite() {
        raw.clamp(0.0, cap_secs)
    } else {
        cap_secs
    };
    let mut delay = Duration::from_secs_f64(secs);

    if backoff.jitter {
        delay += delay.mul_f64(rand::rng().random_range(0.0..=0.25));
    }
    delay.min(Duration::from_secs_f64(cap_secs))
}

#[derive(Debug, Clone)]
enum RetryDelay {
    Immediate,
    Fixed(Duration),
    Backoff(ExponentialBackoff),
}

/// How many times a built-in behavior retries and how long it waits first.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_retries: u32,
    delay: RetryDelay,
}

impl RetryStrategy {
    /// One immediate retry
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_retries: 1,
            delay: RetryDelay::Immediate,
        }
    }

    /// Two retries, each after `delay`
    #[must_use]
    pub fn twice_with_delay(delay: Duration) -> Self {
        Self {
            max_retries: 2,
            delay: RetryDelay::Fixed(delay),
        }
    }

    /// Two retries, each after [`DEFAULT_RETRY_DELAY`]
    #[must_use]
    pub fn twice_with_default_delay() -> Self {
        Self::twice_with_delay(DEFAULT_RETRY_DELAY)
    }

    /// Up to `max_retries` retries with exponential backoff between them
    #[must_use]
    pub fn with_backoff(max_retries: u32, backoff: ExponentialBackoff) -> Self {
        Self {
            max_retries,
            delay: RetryDelay::Backoff(backoff),
        }
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Wait before retry number `attempt + 1`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.delay {
            RetryDelay::Immediate => Duration::ZERO,
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Backoff(backoff) => calculate_backoff(backoff, attempt),
        }
    }
}

type CustomDecider = Arc<dyn Fn(&Task, &ErrorKind, u32, Decision) + Send + Sync>;

#[derive(Clone)]
enum Behavior {
    Custom(CustomDecider),
    NetworkFailure(RetryStrategy),
    NetworkFailureOrServiceUnavailable(RetryStrategy),
}

/// Built-in [`RetryPolicy`] implementations.
///
/// The predefined behaviors only retry idempotent requests (see
/// [`is_idempotent_request`](crate::is_idempotent_request)) unless
/// [`ignoring_idempotence`](RetryBehavior::ignoring_idempotence) is set.
/// They never retry HTTP failures other than 503, nor redirect, content
/// type or parse failures.
#[derive(Clone)]
pub struct RetryBehavior {
    behavior: Behavior,
    ignore_idempotence: bool,
}

impl RetryBehavior {
    /// Fully custom decision. The closure sees every failure, for every
    /// method; none of the built-in filtering applies.
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&Task, &ErrorKind, u32, Decision) + Send + Sync + 'static,
    {
        Self {
            behavior: Behavior::Custom(Arc::new(decide)),
            ignore_idempotence: true,
        }
    }

    /// Retry connection, TLS and timeout failures
    #[must_use]
    pub fn retry_network_failure(strategy: RetryStrategy) -> Self {
        Self {
            behavior: Behavior::NetworkFailure(strategy),
            ignore_idempotence: false,
        }
    }

    /// Retry network failures and `503 Service Unavailable`. A valid
    /// `Retry-After` header on the 503 replaces the strategy's delay.
    #[must_use]
    pub fn retry_network_failure_or_service_unavailable(strategy: RetryStrategy) -> Self {
        Self {
            behavior: Behavior::NetworkFailureOrServiceUnavailable(strategy),
            ignore_idempotence: false,
        }
    }

    /// Also retry requests with non-idempotent methods
    #[must_use]
    pub fn ignoring_idempotence(mut self) -> Self {
        self.ignore_idempotence = true;
        self
    }

    /// Delay before the next attempt, or `None` when a built-in behavior
    /// declines. Not used for custom behaviors.
    fn evaluate(
        &self,
        request: &PreparedRequest,
        error: &ErrorKind,
        attempt: u32,
    ) -> Option<Duration> {
        let (strategy, retry_unavailable) = match &self.behavior {
            Behavior::Custom(_) => return None,
            Behavior::NetworkFailure(strategy) => (strategy, false),
            Behavior::NetworkFailureOrServiceUnavailable(strategy) => (strategy, true),
        };

        if !self.ignore_idempotence && !request.is_idempotent() {
            return None;
        }
        if attempt >= strategy.max_retries {
            return None;
        }

        if error.is_network_failure() {
            return Some(strategy.delay_for(attempt));
        }

        if retry_unavailable
            && let ErrorKind::FailedResponse {
                status, response, ..
            } = error
            && *status == StatusCode::SERVICE_UNAVAILABLE
        {
            return Some(
                response
                    .retry_after()
                    .unwrap_or_else(|| strategy.delay_for(attempt)),
            );
        }

        None
    }
}

impl fmt::Debug for RetryBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RetryBehavior");
        match &self.behavior {
            Behavior::Custom(_) => s.field("behavior", &"custom"),
            Behavior::NetworkFailure(strategy) => s
                .field("behavior", &"network_failure")
                .field("strategy", strategy),
            Behavior::NetworkFailureOrServiceUnavailable(strategy) => s
                .field("behavior", &"network_failure_or_service_unavailable")
                .field("strategy", strategy),
        };
        s.field("ignore_idempotence", &self.ignore_idempotence)
            .finish()
    }
}

impl RetryPolicy for RetryBehavior {
    fn should_retry(&self, task: &Task, error: &ErrorKind, attempt: u32, decision: Decision) {
        if let Behavior::Custom(decide) = &self.behavior {
            decide(task, error, attempt, decision);
            return;
        }

        let Some(delay) = self.evaluate(task.request(), error, attempt) else {
            decision.complete(false);
            return;
        };

        tracing::debug!(
            task_id = task.id(),
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying after failure"
        );

        if delay.is_zero() {
            decision.complete(true);
            return;
        }

        task.runtime().spawn(async move {
            tokio::time::sleep(delay).await;
            decision.complete(true);
        });
    }
}
