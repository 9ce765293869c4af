//! Circuit breaker shared by all workers calling one logical endpoint.
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open rejects
//! every request until `cooldown` has elapsed, then Half-Open admits at most
//! `half_open_max_calls` concurrent trial requests. `success_threshold`
//! trial successes close the circuit again; any trial failure reopens it.
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown: Duration,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    trial_successes: u32,
    trials_in_flight: u32,
    opened_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_successes: 0,
            trials_in_flight: 0,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

/// Admission ticket for one request. Settle it with [`Permit::succeed`] or
/// [`Permit::fail`]; dropping it unsettled releases the slot without
/// counting an outcome.
#[must_use]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.trial);
        }
    }
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // State stays consistent even if a holder panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cooldown_elapsed(&self, st: &BreakerState) -> bool {
        st.opened_at
            .is_none_or(|opened| opened.elapsed() >= self.config.cooldown)
    }

    /// Current state, reporting an Open circuit whose cooldown has elapsed as
    /// Half-Open.
    pub fn state(&self) -> CircuitState {
        let st = self.lock();
        if st.state == CircuitState::Open && self.cooldown_elapsed(&st) {
            CircuitState::HalfOpen
        } else {
            st.state
        }
    }

    /// True while requests are being rejected outright.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Ask to send one request.
    pub fn try_acquire(&self) -> Result<Permit<'_>, ServiceError> {
        let mut st = self.lock();

        if st.state == CircuitState::Open {
            if !self.cooldown_elapsed(&st) {
                debug!("Circuit breaker {} rejected request (open)", self.endpoint);
                return Err(self.open_error());
            }
            st.state = CircuitState::HalfOpen;
            st.trial_successes = 0;
            st.trials_in_flight = 0;
            info!(
                endpoint = %self.endpoint,
                "Circuit breaker entering half-open state"
            );
        }

        match st.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::HalfOpen => {
                if st.trials_in_flight >= self.config.half_open_max_calls {
                    debug!(
                        "Circuit breaker {} rejected request (trial slots busy)",
                        self.endpoint
                    );
                    return Err(self.open_error());
                }
                st.trials_in_flight += 1;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::Open => Err(self.open_error()),
        }
    }

    /// Force the circuit back to Closed.
    pub fn reset(&self) {
        let mut st = self.lock();
        *st = BreakerState::default();
        info!(endpoint = %self.endpoint, "Circuit breaker manually reset");
    }

    fn open_error(&self) -> ServiceError {
        ServiceError::CircuitOpen {
            endpoint: self.endpoint.clone(),
        }
    }

    fn record_success(&self, trial: bool) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => st.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                st.trials_in_flight = st.trials_in_flight.saturating_sub(1);
                st.trial_successes += 1;
                debug!(
                    "Circuit breaker {} half-open success {}/{}",
                    self.endpoint, st.trial_successes, self.config.success_threshold
                );
                if st.trial_successes >= self.config.success_threshold {
                    *st = BreakerState::default();
                    info!(
                        endpoint = %self.endpoint,
                        "Circuit breaker closed (service recovered)"
                    );
                }
            }
            // A request admitted before the circuit tripped; its outcome is stale.
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut st = self.lock();
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures += 1;
                if st.consecutive_failures >= self.config.failure_threshold {
                    st.state = CircuitState::Open;
                    st.opened_at = Some(Instant::now());
                    error!(
                        endpoint = %self.endpoint,
                        failures = st.consecutive_failures,
                        cooldown_secs = self.config.cooldown.as_secs_f64(),
                        "Circuit breaker opened (failure threshold reached)"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                st.state = CircuitState::Open;
                st.opened_at = Some(Instant::now());
                st.consecutive_failures = 0;
                st.trial_successes = 0;
                st.trials_in_flight = 0;
                warn!(
                    endpoint = %self.endpoint,
                    "Circuit breaker reopened (trial request failed)"
                );
            }
            _ => {}
        }
    }

    fn release(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut st = self.lock();
        if st.state == CircuitState::HalfOpen {
            st.trials_in_flight = st.trials_in_flight.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "analysis",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                cooldown: Duration::from_secs(30),
                half_open_max_calls: 1,
            },
        )
    }

    fn trip(cb: &CircuitBreaker) {
        for _ in 0..cb.config().failure_threshold {
            cb.try_acquire().unwrap().fail();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let cb = breaker();
        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);

        for _ in 0..10 {
            let err = cb.try_acquire().err().unwrap();
            assert!(err.is_circuit_open());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker();
        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().succeed();
        cb.try_acquire().unwrap().fail();
        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trials_and_closes() {
        let cb = breaker();
        trip(&cb);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        // Only one trial slot.
        assert!(cb.try_acquire().is_err());
        trial.succeed();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.try_acquire().unwrap().succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens_with_fresh_cooldown() {
        let cb = breaker();
        trip(&cb);
        tokio::time::advance(Duration::from_secs(31)).await;

        cb.try_acquire().unwrap().fail();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(cb.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_frees_slot() {
        let cb = breaker();
        trip(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        let trial = cb.try_acquire().unwrap();
        drop(trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let cb = breaker();
        trip(&cb);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }
}
