//! Resilience stack builder for composing policies.
//!
//! Composition order is fixed: Retry wraps CircuitBreaker wraps Timeout wraps
//! the operation. A circuit-open rejection and a timeout both count as a
//! retryable-or-not outcome exactly like any other `ResilienceError`, decided
//! by the retry policy's `should_retry` predicate.

use crate::{
    CircuitBreakerConfig, CircuitBreakerPolicy, ResilienceError, RetryPolicy, TimeoutError,
    TimeoutPolicy,
};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors that can occur while building a [`ResilienceStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    Timeout(TimeoutError),
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackError::Timeout(e) => write!(f, "invalid timeout configuration: {e}"),
        }
    }
}

impl std::error::Error for StackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StackError::Timeout(e) => Some(e),
        }
    }
}

impl From<TimeoutError> for StackError {
    fn from(e: TimeoutError) -> Self {
        StackError::Timeout(e)
    }
}

#[derive(Clone)]
pub struct ResilienceStack<E> {
    pub(crate) timeout: TimeoutPolicy,
    pub(crate) circuit_breaker: CircuitBreakerPolicy,
    pub(crate) retry: RetryPolicy<E>,
}

impl<E> ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> ResilienceStackBuilder<E> {
        ResilienceStackBuilder::new()
    }

    /// Execute `operation` through the full stack, with no cancellation context.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_cancellable(&CancellationToken::new(), operation).await
    }

    /// Execute `operation` through the full stack, propagating `ctx` down to
    /// both the retry loop and the innermost timeout so a cancellation fires
    /// promptly regardless of which layer is currently waiting.
    pub async fn execute_cancellable<T, Fut, Op>(
        &self,
        ctx: &CancellationToken,
        operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        use std::sync::{Arc, Mutex};

        let op_cell = Arc::new(Mutex::new(operation));

        self.retry
            .execute_cancellable(ctx, || {
                let op = op_cell.clone();
                let circuit_breaker = self.circuit_breaker.clone();
                let timeout = self.timeout.clone();
                let ctx = ctx.clone();

                async move {
                    circuit_breaker
                        .execute(|| {
                            let op = op.clone();
                            let timeout = timeout.clone();
                            let ctx = ctx.clone();
                            async move {
                                timeout
                                    .execute_cancellable(&ctx, || {
                                        let mut op = op.lock().unwrap();
                                        op()
                                    })
                                    .await
                            }
                        })
                        .await
                }
            })
            .await
    }
}

impl<E> Default for ResilienceStack<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        ResilienceStackBuilder::new()
            .build()
            .expect("default stack configuration is always valid")
    }
}

pub struct ResilienceStackBuilder<E> {
    timeout: Option<Duration>,
    circuit_breaker: Option<CircuitBreakerPolicy>,
    retry: Option<RetryPolicy<E>>,
}

impl<E> ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { timeout: None, circuit_breaker: None, retry: None }
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = Some(Duration::from_secs(u64::MAX / 1000));
        self
    }

    pub fn circuit_breaker(mut self, minimum_throughput: usize, break_duration: Duration) -> Self {
        self.circuit_breaker = Some(CircuitBreakerPolicy::new(minimum_throughput, break_duration));
        self
    }

    pub fn circuit_breaker_with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(CircuitBreakerPolicy::with_config(config));
        self
    }

    pub fn no_circuit_breaker(mut self) -> Self {
        self.circuit_breaker =
            Some(CircuitBreakerPolicy::with_config(CircuitBreakerConfig::disabled()));
        self
    }

    pub fn retry(mut self, policy: RetryPolicy<E>) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn build(self) -> Result<ResilienceStack<E>, StackError> {
        let timeout_duration = self.timeout.unwrap_or(Duration::from_secs(30));
        Ok(ResilienceStack {
            timeout: TimeoutPolicy::new(timeout_duration)?,
            circuit_breaker: self
                .circuit_breaker
                .unwrap_or_else(|| CircuitBreakerPolicy::with_config(CircuitBreakerConfig::default())),
            retry: self.retry.unwrap_or_else(|| RetryPolicy::builder().build()),
        })
    }
}

impl<E> Default for ResilienceStackBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
