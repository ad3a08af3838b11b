//! Timeout, retry with backoff, and a per-provider circuit breaker around
//! upstream calls.
//!
//! One [`CircuitBreaker`] exists per provider key inside a [`BreakerRegistry`].
//! The registry is an explicit value handed to every adapter, so all callers of
//! a provider observe and mutate the same state machine while tests can build a
//! fresh registry per case.

use crate::client::{ApiError, ApiResult, TransientKind};
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    /// Normal operation; calls proceed.
    Closed,
    /// Tripped: calls fail fast until the cooldown elapses.
    Open,
    /// Cooldown elapsed; a limited number of probe calls are let through.
    HalfOpen,
}

/// Point-in-time view of one provider's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerState {
    pub provider: String,
    pub state: BreakerPhase,
    pub consecutive_failure_count: u32,
    pub consecutive_success_count: u32,
    /// Epoch seconds of the last trip.
    pub opened_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker again.
    pub success_threshold: u32,
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            cooldown: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    phase: BreakerPhase,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    opened_at_epoch: Option<i64>,
    probes_in_flight: u32,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]; hand it back
/// when recording the outcome. A half-open probe permit dropped without an
/// outcome (the call was cancelled) counts as a failed probe, so its slot is
/// never leaked.
#[derive(Debug)]
#[must_use = "record the call's outcome with the permit"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            debug!("{}: probe abandoned before an outcome", self.breaker.provider);
            self.breaker.on_failure(true);
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(BreakerInner {
                phase: BreakerPhase::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                opened_at_epoch: None,
                probes_in_flight: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask to make one upstream call. `None` means the breaker refuses and no
    /// network attempt may be made.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let permit = |probe| Permit { breaker: self, probe, settled: false };
        let mut inner = self.lock();
        match inner.phase {
            BreakerPhase::Closed => Some(permit(false)),
            BreakerPhase::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled {
                    return None;
                }
                info!("circuit breaker for {} half-open, allowing probe", self.provider);
                inner.phase = BreakerPhase::HalfOpen;
                inner.successes = 0;
                inner.probes_in_flight = 1;
                Some(permit(true))
            }
            BreakerPhase::HalfOpen => {
                if inner.probes_in_flight >= self.config.half_open_max_probes.max(1) {
                    return None;
                }
                inner.probes_in_flight += 1;
                Some(permit(true))
            }
        }
    }

    pub fn record_success(&self, mut permit: Permit<'_>) {
        permit.settled = true;
        let mut inner = self.lock();
        if permit.probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        match inner.phase {
            BreakerPhase::Closed => inner.failures = 0,
            BreakerPhase::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold.max(1) {
                    info!("circuit breaker for {} closed after successful probe", self.provider);
                    inner.phase = BreakerPhase::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    inner.probes_in_flight = 0;
                }
            }
            // A call admitted before the trip finished late; it does not reopen traffic.
            BreakerPhase::Open => {}
        }
    }

    pub fn record_failure(&self, mut permit: Permit<'_>) {
        permit.settled = true;
        self.on_failure(permit.probe);
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        match inner.phase {
            BreakerPhase::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold.max(1) {
                    self.trip(&mut inner);
                }
            }
            BreakerPhase::HalfOpen => {
                inner.failures += 1;
                self.trip(&mut inner);
            }
            BreakerPhase::Open => inner.failures += 1,
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        warn!(
            "circuit breaker for {} opened after {} consecutive failures (cooldown {}s)",
            self.provider,
            inner.failures,
            self.config.cooldown.as_secs()
        );
        inner.phase = BreakerPhase::Open;
        inner.successes = 0;
        inner.probes_in_flight = 0;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_epoch = Some(Utc::now().timestamp());
    }

    pub fn phase(&self) -> BreakerPhase {
        self.lock().phase
    }

    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            provider: self.provider.clone(),
            state: inner.phase,
            consecutive_failure_count: inner.failures,
            consecutive_success_count: inner.successes,
            opened_at: inner.opened_at_epoch.filter(|_| inner.phase != BreakerPhase::Closed),
        }
    }
}

/// Process-wide set of breakers, one per provider key.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config, breakers: DashMap::new() }
    }

    pub fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(provider.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider, self.config)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<CircuitBreakerState> =
            self.breakers.iter().map(|entry| entry.value().state()).collect();
        states.sort_by(|a, b| a.provider.cmp(&b.provider));
        states
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry `attempt` (1-based), capped, without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay)
    }

    /// Backoff plus up to 20% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        let jitter_range = (base.as_millis() as u64) / 5;
        if jitter_range == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_range))
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Wraps one upstream call with timeout, retry and the provider's breaker.
#[derive(Debug, Clone)]
pub struct ResilienceGuard {
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl ResilienceGuard {
    pub fn new(policy: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self { policy, breakers }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Run `op` under the guard. `op` is invoked once per attempt.
    ///
    /// Only transient failures are retried. Every attempt's outcome feeds the
    /// provider's breaker: transient failures count against it, while
    /// successes and permanent failures (the upstream did answer) count as
    /// liveness.
    pub async fn call<T, F, Fut>(&self, provider: &str, mut op: F) -> ApiResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let breaker = self.breakers.breaker(provider);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error: Option<ApiError> = None;

        for attempt in 1..=max_attempts {
            let Some(permit) = breaker.try_acquire() else {
                return Err(last_error
                    .unwrap_or_else(|| ApiError::BreakerOpen { provider: provider.to_owned() }));
            };

            let outcome = match tokio::time::timeout(self.policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Transient {
                    kind: TransientKind::Timeout,
                    target: provider.to_owned(),
                }),
            };

            match outcome {
                Ok(value) => {
                    breaker.record_success(permit);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    breaker.record_failure(permit);
                    if attempt < max_attempts {
                        let delay = self.policy.backoff(attempt);
                        debug!(
                            "{provider}: attempt {attempt}/{max_attempts} failed ({err}), retrying in {}ms",
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
                Err(err) => {
                    breaker.record_success(permit);
                    return Err(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ApiError::BreakerOpen { provider: provider.to_owned() }))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
