//! Prometheus exporters for `ninelives`.
//!
//! Two complementary surfaces are provided:
//!
//! - [`PrometheusSink`]: a generic `TelemetrySink` that counts every
//!   [`PolicyEvent`] by policy and event kind. Cheap to wire in, useful for a
//!   first dashboard.
//! - [`PrometheusMetrics`]: a [`Metrics`] implementation exposing the exact
//!   metric and tag names operators expect (`http_requests_total`,
//!   `circuit_breaker_state_changes_total`, `saga_executions_total`, ...).
//!
//! Bring your own `prometheus::Registry`; both register their collectors into
//! it, so a single `/metrics` HTTP handler can scrape everything.

use ninelives::telemetry::{
    CircuitBreakerEvent, Metrics, PolicyEvent, RequestOutcome, RetryEvent, SagaEvent, TelemetrySink,
    TimeoutEvent,
};
use prometheus::{CounterVec, HistogramVec, IntCounterVec, IntGauge, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Generic telemetry sink: one counter keyed by policy and event kind.
#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register its counter into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new("ninelives_events_total", "Policy events"),
            &["policy", "event"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<PolicyEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: PolicyEvent) -> Self::Future {
        let (policy_label, event_label) = match &event {
            PolicyEvent::Retry(r) => (
                "retry",
                match r {
                    RetryEvent::Attempt { .. } => "attempt",
                    RetryEvent::Exhausted { .. } => "exhausted",
                },
            ),
            PolicyEvent::CircuitBreaker(c) => (
                "circuit_breaker",
                match c {
                    CircuitBreakerEvent::Opened { .. } => "opened",
                    CircuitBreakerEvent::HalfOpen => "half_open",
                    CircuitBreakerEvent::Closed => "closed",
                },
            ),
            PolicyEvent::Timeout(t) => (
                "timeout",
                match t {
                    TimeoutEvent::Occurred { .. } => "occurred",
                },
            ),
            PolicyEvent::Request(r) => (
                "request",
                match r {
                    RequestOutcome::Success { .. } => "success",
                    RequestOutcome::Failure { .. } => "failure",
                },
            ),
            PolicyEvent::Saga(s) => (
                "saga",
                match s {
                    SagaEvent::Started { .. } => "started",
                    SagaEvent::StepSucceeded { .. } => "step_succeeded",
                    SagaEvent::StepFailed { .. } => "step_failed",
                    SagaEvent::CompensationStarted { .. } => "compensation_started",
                    SagaEvent::StepCompensated { .. } => "step_compensated",
                    SagaEvent::Completed { .. } => "completed",
                },
            ),
            PolicyEvent::Bus(_) => ("bus", "event"),
        };
        let c = self.counter.clone();
        c.with_label_values(&[policy_label, event_label]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}

/// [`Metrics`] implementation exposing the canonical metric/tag surface.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Arc<Registry>,
    http_requests_total: IntCounterVec,
    http_request_duration_ms: HistogramVec,
    circuit_breaker_state_changes_total: IntCounterVec,
    retry_attempts_total: IntCounterVec,
    saga_executions_total: IntCounterVec,
    saga_execution_duration_ms: HistogramVec,
    saga_step_execution_duration_ms: HistogramVec,
    message_operations_total: IntCounterVec,
    message_operation_duration_ms: HistogramVec,
    health_check_duration_ms: HistogramVec,
    memory_usage_bytes: IntGauge,
    active_connections: IntGauge,
    // Ratio tags (is_successful) occasionally need float precision for rate()
    // queries downstream; kept alongside the int counter that drives alerting.
    _retry_attempts_ratio: CounterVec,
}

impl PrometheusMetrics {
    /// Register all collectors into the provided registry.
    ///
    /// # Errors
    /// Returns an error if any metric name collides with one already
    /// registered (e.g. calling this twice against the same registry).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();

        let http_requests_total = IntCounterVec::new(
            prometheus::Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "endpoint", "status_code"],
        )?;
        let http_request_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "http_request_duration_ms",
                "HTTP request duration in milliseconds",
            ),
            &["method", "endpoint"],
        )?;
        let circuit_breaker_state_changes_total = IntCounterVec::new(
            prometheus::Opts::new(
                "circuit_breaker_state_changes_total",
                "Circuit breaker state transitions",
            ),
            &["circuit_breaker_name", "from_state", "to_state"],
        )?;
        let retry_attempts_total = IntCounterVec::new(
            prometheus::Opts::new("retry_attempts_total", "Retry attempts made"),
            &["operation", "attempt_number", "is_successful"],
        )?;
        let saga_executions_total = IntCounterVec::new(
            prometheus::Opts::new("saga_executions_total", "Saga executions by outcome"),
            &["saga_name", "result"],
        )?;
        let saga_execution_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "saga_execution_duration_ms",
                "Total saga execution duration in milliseconds",
            ),
            &["saga_name"],
        )?;
        let saga_step_execution_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "saga_step_execution_duration_ms",
                "Per-saga step execution duration in milliseconds",
            ),
            &["saga_name", "step_count"],
        )?;
        let message_operations_total = IntCounterVec::new(
            prometheus::Opts::new("message_operations_total", "Message bus operations"),
            &["message_type", "operation", "status"],
        )?;
        let message_operation_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "message_operation_duration_ms",
                "Message bus operation duration in milliseconds",
            ),
            &["message_type", "operation"],
        )?;
        let health_check_duration_ms = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "health_check_duration_ms",
                "Health check probe duration in milliseconds",
            ),
            &[],
        )?;
        let memory_usage_bytes =
            IntGauge::new("memory_usage_bytes", "Resident memory usage in bytes")?;
        let active_connections =
            IntGauge::new("active_connections", "Currently active outbound connections")?;
        let retry_attempts_ratio = CounterVec::new(
            prometheus::Opts::new(
                "retry_attempts_ratio_total",
                "Retry attempts made, float-typed for rate() queries",
            ),
            &["operation", "attempt_number", "is_successful"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_ms.clone()))?;
        registry.register(Box::new(circuit_breaker_state_changes_total.clone()))?;
        registry.register(Box::new(retry_attempts_total.clone()))?;
        registry.register(Box::new(saga_executions_total.clone()))?;
        registry.register(Box::new(saga_execution_duration_ms.clone()))?;
        registry.register(Box::new(saga_step_execution_duration_ms.clone()))?;
        registry.register(Box::new(message_operations_total.clone()))?;
        registry.register(Box::new(message_operation_duration_ms.clone()))?;
        registry.register(Box::new(health_check_duration_ms.clone()))?;
        registry.register(Box::new(memory_usage_bytes.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(retry_attempts_ratio.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_ms,
            circuit_breaker_state_changes_total,
            retry_attempts_total,
            saga_executions_total,
            saga_execution_duration_ms,
            saga_step_execution_duration_ms,
            message_operations_total,
            message_operation_duration_ms,
            health_check_duration_ms,
            memory_usage_bytes,
            active_connections,
            _retry_attempts_ratio: retry_attempts_ratio,
        })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl Metrics for PrometheusMetrics {
    fn record_http_request(&self, method: &str, endpoint: &str, status_code: u16) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status_code.to_string()])
            .inc();
    }

    fn record_http_duration(&self, method: &str, endpoint: &str, duration: Duration) {
        self.http_request_duration_ms
            .with_label_values(&[method, endpoint])
            .observe(millis(duration));
    }

    fn record_circuit_breaker_transition(
        &self,
        circuit_breaker_name: &str,
        from_state: &str,
        to_state: &str,
    ) {
        self.circuit_breaker_state_changes_total
            .with_label_values(&[circuit_breaker_name, from_state, to_state])
            .inc();
    }

    fn record_retry_attempt(&self, operation: &str, attempt_number: u32, is_successful: bool) {
        self.retry_attempts_total
            .with_label_values(&[operation, &attempt_number.to_string(), &is_successful.to_string()])
            .inc();
    }

    fn record_saga_execution(&self, saga_name: &str, result: &str) {
        self.saga_executions_total.with_label_values(&[saga_name, result]).inc();
    }

    fn record_saga_duration(&self, saga_name: &str, duration: Duration) {
        self.saga_execution_duration_ms.with_label_values(&[saga_name]).observe(millis(duration));
    }

    fn record_saga_step_duration(&self, saga_name: &str, step_count: usize, duration: Duration) {
        self.saga_step_execution_duration_ms
            .with_label_values(&[saga_name, &step_count.to_string()])
            .observe(millis(duration));
    }

    fn record_message_operation(&self, message_type: &str, operation: &str, status: &str) {
        self.message_operations_total
            .with_label_values(&[message_type, operation, status])
            .inc();
    }

    fn record_message_duration(&self, message_type: &str, operation: &str, duration: Duration) {
        self.message_operation_duration_ms
            .with_label_values(&[message_type, operation])
            .observe(millis(duration));
    }

    fn record_health_check_duration(&self, duration: Duration) {
        self.health_check_duration_ms.with_label_values(&[]).observe(millis(duration));
    }

    fn record_memory_usage(&self, bytes: u64) {
        self.memory_usage_bytes.set(bytes as i64);
    }

    fn record_active_connections(&self, count: i64) {
        self.active_connections.set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_name_collisions() {
        let registry = Registry::new();
        let metrics = PrometheusMetrics::new(registry).expect("collectors register cleanly");
        metrics.record_http_request("GET", "/orders", 200);
        metrics.record_circuit_breaker_transition("payments", "closed", "open");
        metrics.record_saga_execution("checkout", "completed");
        assert_eq!(metrics.registry().gather().is_empty(), false);
    }

    #[test]
    fn sink_counts_events_by_kind() {
        let registry = Registry::new();
        let mut sink = PrometheusSink::new(registry).unwrap();
        let _ = tower_service::Service::call(
            &mut sink,
            PolicyEvent::CircuitBreaker(CircuitBreakerEvent::Opened { failure_count: 3 }),
        );
    }
}
