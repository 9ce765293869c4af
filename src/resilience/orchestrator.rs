//! Timeout + retry + circuit breaker around one logical endpoint.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::{BreakerConfig, CircuitBreaker, RetryPolicy, ServiceError};
use crate::config::Config;

/// Sole egress point for requests to one inference endpoint.
///
/// Cheap to share: hand the same `Arc<Orchestrator>` to every worker so they
/// all observe (and feed) the same breaker.
pub struct Orchestrator {
    endpoint: String,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        endpoint: impl Into<String>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            breaker,
            retry,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `op` under the breaker, retrying transient failures.
    ///
    /// The breaker sees a single outcome per call: success, or the error left
    /// after retries are exhausted. Non-transient errors are returned at once
    /// and are not counted against the endpoint.
    pub async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let permit = self.breaker.try_acquire()?;
        let mut retry = 0u32;

        loop {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout),
            };

            match outcome {
                Ok(value) => {
                    if retry > 0 {
                        info!(
                            endpoint = %self.endpoint,
                            attempts = retry + 1,
                            "Request succeeded after retry"
                        );
                    }
                    permit.succeed();
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retry < self.retry.max_retries => {
                    retry += 1;
                    let delay = self.retry.delay_for(retry);
                    warn!(
                        endpoint = %self.endpoint,
                        attempt = retry + 1,
                        max_attempts = self.retry.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after transient failure: {e}"
                    );
                    tokio::time::sleep(delay).await;

                    if self.breaker.is_open() {
                        // Another worker tripped the circuit while we slept.
                        return Err(ServiceError::CircuitOpen {
                            endpoint: self.endpoint.clone(),
                        });
                    }
                }
                Err(e) if e.is_transient() => {
                    error!(
                        endpoint = %self.endpoint,
                        attempts = retry + 1,
                        "All retry attempts exhausted: {e}"
                    );
                    permit.fail();
                    return Err(e);
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, "Non-retryable failure: {e}");
                    drop(permit);
                    return Err(e);
                }
            }
        }
    }
}

/// The two logical endpoints of the inference service.
#[derive(Clone)]
pub struct Endpoints {
    pub embedding: Arc<Orchestrator>,
    pub analysis: Arc<Orchestrator>,
}

impl Endpoints {
    pub fn new(retry: RetryPolicy, breaker: BreakerConfig, timeout: Duration) -> Self {
        let orchestrator = |name: &str| {
            Arc::new(Orchestrator::new(
                name,
                Arc::new(CircuitBreaker::new(name, breaker.clone())),
                retry.clone(),
                timeout,
            ))
        };
        Self {
            embedding: orchestrator("embedding"),
            analysis: orchestrator("analysis"),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.retry.policy(),
            config.breaker.to_breaker_config(),
            Duration::from_secs(config.llm.timeout_secs),
        )
    }
}
