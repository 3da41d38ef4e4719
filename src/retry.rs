//! Retry policy implementation
//!
//! Provides configurable retry with backoff and jitter, plus retry predicate and pluggable sleeper.

use crate::error::MAX_RETRY_FAILURES;
use crate::telemetry::{Metrics, NoopMetrics};
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct RetryPolicy<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    /// Whether a per-attempt `ResilienceError::Timeout` counts as transient
    /// and is retried like any other eligible failure. Defaults to `true`
    /// per spec §7.4; callers that want timeouts to short-circuit instead
    /// can opt out via [`RetryPolicyBuilder::retry_on_timeout`].
    retry_on_timeout: bool,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<dyn Metrics>,
    /// Label recorded as the `operation` tag on `retry_attempts_total`.
    operation: Arc<str>,
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on_timeout", &self.retry_on_timeout)
            .field("sleeper", &"<sleeper>")
            .field("metrics", &"<metrics>")
            .field("operation", &self.operation)
            .finish()
    }
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Execute `operation` with retry, with no external cancellation context.
    ///
    /// Equivalent to [`Self::execute_cancellable`] with a token that is never
    /// cancelled.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_cancellable(&CancellationToken::new(), operation).await
    }

    /// Execute `operation` with retry, cancellation-aware.
    ///
    /// `ctx` is checked before each attempt and raced against the inter-attempt
    /// sleep; if it fires, retrying stops immediately and
    /// `ResilienceError::Cancelled` is returned without counting as a transient
    /// failure (cancellation is never retried, per the retry contract).
    pub async fn execute_cancellable<T, Fut, Op>(
        &self,
        ctx: &CancellationToken,
        mut operation: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut failures = Vec::new();

        for attempt in 0..self.max_attempts {
            if ctx.is_cancelled() {
                return Err(ResilienceError::Cancelled);
            }

            let result = operation().await;
            self.metrics.record_retry_attempt(&self.operation, (attempt + 1) as u32, result.is_ok());

            match result {
                Ok(value) => return Ok(value),
                Err(ResilienceError::Inner(e)) => {
                    // Check if we should retry this error
                    if !(self.should_retry)(&e) {
                        return Err(ResilienceError::Inner(e));
                    }

                    failures.push(e);
                    if failures.len() > MAX_RETRY_FAILURES {
                        let excess = failures.len() - MAX_RETRY_FAILURES;
                        failures.drain(0..excess);
                    }

                    // If this was the last attempt, return RetryExhausted
                    if attempt + 1 >= self.max_attempts {
                        return Err(ResilienceError::RetryExhausted {
                            attempts: self.max_attempts,
                            failures,
                        });
                    }

                    // Calculate backoff delay (backoff.delay is 1-indexed)
                    let mut delay = self.backoff.delay(attempt + 1);

                    // Apply jitter
                    delay = self.jitter.apply(delay);

                    // Sleep before next attempt, unless cancelled first.
                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        _ = ctx.cancelled() => return Err(ResilienceError::Cancelled),
                    }
                }
                // Per §7.4, a timeout is treated as transient by default: it is
                // retried exactly like an `Inner` failure, just without an `E`
                // value to accumulate. `retry_on_timeout` is the caller's
                // override to opt a timeout out of retry entirely.
                Err(ResilienceError::Timeout { elapsed, timeout }) => {
                    if !self.retry_on_timeout || attempt + 1 >= self.max_attempts {
                        return Err(ResilienceError::Timeout { elapsed, timeout });
                    }

                    let mut delay = self.backoff.delay(attempt + 1);
                    delay = self.jitter.apply(delay);

                    tokio::select! {
                        _ = self.sleeper.sleep(delay) => {}
                        _ = ctx.cancelled() => return Err(ResilienceError::Cancelled),
                    }
                }
                // CircuitOpen and Cancelled are never retried.
                Err(e) => return Err(e),
            }
        }

        // Should be unreachable due to loop logic, but satisfy compiler
        unreachable!("Retry loop should have returned or errored")
    }
}

pub struct RetryPolicyBuilder<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    should_retry: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    retry_on_timeout: bool,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<dyn Metrics>,
    operation: Arc<str>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    InvalidMaxAttempts(usize),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::InvalidMaxAttempts(n) => {
                write!(f, "max_attempts must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1)),
            jitter: Jitter::full(),
            should_retry: Arc::new(|_| true),
            retry_on_timeout: true,
            sleeper: Arc::new(TokioSleeper),
            metrics: Arc::new(NoopMetrics),
            operation: Arc::from("unknown"),
        }
    }

    pub fn max_attempts(mut self, attempts: usize) -> Result<Self, BuildError> {
        if attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(attempts));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Whether a per-attempt `ResilienceError::Timeout` is retried like a
    /// transient failure. Defaults to `true`; set `false` to have a timeout
    /// short-circuit the retry loop immediately instead.
    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Attach a metrics sink; `retry_attempts_total` is recorded once per
    /// attempt, tagged with the operation name set via [`Self::operation`].
    pub fn metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the `operation` tag recorded against every `retry_attempts_total`
    /// observation. Defaults to `"unknown"`.
    pub fn operation(mut self, name: impl Into<Arc<str>>) -> Self {
        self.operation = name.into();
        self
    }

    pub fn build(self) -> RetryPolicy<E> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            should_retry: self.should_retry,
            retry_on_timeout: self.retry_on_timeout,
            sleeper: self.sleeper,
            metrics: self.metrics,
            operation: self.operation,
        }
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

use crate::telemetry::{emit_best_effort, NullSink, PolicyEvent, RetryEvent};
use futures::future::BoxFuture;
use tower_service::Service;

/// Tower-native retry layer with optional telemetry, mirroring [`crate::timeout::TimeoutLayer`].
#[derive(Clone)]
pub struct RetryLayer<E, Sink = NullSink> {
    policy: RetryPolicy<E>,
    sink: Sink,
}

impl<E> RetryLayer<E, NullSink>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Build a retry layer from an existing policy, with no telemetry.
    pub fn new(policy: RetryPolicy<E>) -> Self {
        RetryLayer { policy, sink: NullSink }
    }
}

impl<E, Sink> RetryLayer<E, Sink>
where
    E: std::error::Error + Send + Sync + 'static,
    Sink: Clone,
{
    /// Attach a telemetry sink to this retry layer.
    pub fn with_sink<NewSink>(self, sink: NewSink) -> RetryLayer<E, NewSink>
    where
        NewSink: Clone,
    {
        RetryLayer { policy: self.policy, sink }
    }
}

/// Service produced by [`RetryLayer`]; wraps an inner service with retry.
#[derive(Clone)]
pub struct RetryService<S, E, Sink = NullSink> {
    inner: S,
    policy: RetryPolicy<E>,
    sink: Sink,
}

impl<S, Request, E, Sink> Service<Request> for RetryService<S, E, Sink>
where
    S: Service<Request, Error = E> + Clone + Send + 'static,
    Request: Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Future: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    Sink: tower::Service<PolicyEvent, Response = ()> + Clone + Send + 'static,
    Sink::Error: std::error::Error + Send + 'static,
    Sink::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<E>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(ResilienceError::Inner)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let policy = self.policy.clone();
        let mut inner = self.inner.clone();
        let sink = self.sink.clone();
        let backoff = policy.backoff.clone();
        let jitter = policy.jitter.clone();

        Box::pin(async move {
            let start = std::time::Instant::now();
            let mut attempt: usize = 0;

            let result = policy
                .execute(|| {
                    let req = req.clone();
                    attempt += 1;
                    let sink = sink.clone();
                    let delay = jitter.apply(backoff.delay(attempt));
                    let fut = inner.call(req);
                    async move {
                        if attempt > 1 {
                            emit_best_effort(
                                sink,
                                PolicyEvent::Retry(RetryEvent::Attempt { attempt, delay }),
                            )
                            .await;
                        }
                        fut.await.map_err(ResilienceError::Inner)
                    }
                })
                .await;

            if let Err(ResilienceError::RetryExhausted { attempts, .. }) = &result {
                emit_best_effort(
                    sink.clone(),
                    PolicyEvent::Retry(RetryEvent::Exhausted {
                        total_attempts: *attempts,
                        total_duration: start.elapsed(),
                    }),
                )
                .await;
            }

            result
        })
    }
}

impl<S, E, Sink> tower_layer::Layer<S> for RetryLayer<E, Sink>
where
    E: std::error::Error + Send + Sync + 'static,
    Sink: Clone,
{
    type Service = RetryService<S, E, Sink>;
    fn layer(&self, service: S) -> Self::Service {
        RetryService { inner: service, policy: self.policy.clone(), sink: self.sink.clone() }
    }
}
