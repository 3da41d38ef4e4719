//! Metrics surface matching the canonical metric and tag names services are
//! expected to expose: request counts/latencies, breaker transitions, retry
//! attempts, saga outcomes, message bus operations, and basic process gauges.

use std::time::Duration;

/// Typed metrics sink. Implementors decide how each observation is stored or
/// exported (Prometheus, statsd, a test double, ...).
pub trait Metrics: Send + Sync + 'static {
    /// `http_requests_total{method,endpoint,status_code}`
    fn record_http_request(&self, method: &str, endpoint: &str, status_code: u16);
    /// `http_request_duration_ms{method,endpoint}`
    fn record_http_duration(&self, method: &str, endpoint: &str, duration: Duration);

    /// `circuit_breaker_state_changes_total{circuit_breaker_name,from_state,to_state}`
    fn record_circuit_breaker_transition(
        &self,
        circuit_breaker_name: &str,
        from_state: &str,
        to_state: &str,
    );

    /// `retry_attempts_total{operation,attempt_number,is_successful}`
    fn record_retry_attempt(&self, operation: &str, attempt_number: u32, is_successful: bool);

    /// `saga_executions_total{saga_name,result}`
    fn record_saga_execution(&self, saga_name: &str, result: &str);
    /// `saga_execution_duration_ms{saga_name}`
    fn record_saga_duration(&self, saga_name: &str, duration: Duration);
    /// `saga_step_execution_duration_ms{saga_name,step_count}`
    fn record_saga_step_duration(&self, saga_name: &str, step_count: usize, duration: Duration);

    /// `message_operations_total{message_type,operation,status}`
    fn record_message_operation(&self, message_type: &str, operation: &str, status: &str);
    /// `message_operation_duration_ms{message_type,operation}`
    fn record_message_duration(&self, message_type: &str, operation: &str, duration: Duration);

    /// `health_check_duration_ms`
    fn record_health_check_duration(&self, duration: Duration);
    /// `memory_usage_bytes` gauge
    fn record_memory_usage(&self, bytes: u64);
    /// `active_connections` gauge
    fn record_active_connections(&self, count: i64);
}

/// A metrics sink that discards every observation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_http_request(&self, _method: &str, _endpoint: &str, _status_code: u16) {}
    fn record_http_duration(&self, _method: &str, _endpoint: &str, _duration: Duration) {}
    fn record_circuit_breaker_transition(&self, _name: &str, _from: &str, _to: &str) {}
    fn record_retry_attempt(&self, _operation: &str, _attempt_number: u32, _is_successful: bool) {}
    fn record_saga_execution(&self, _saga_name: &str, _result: &str) {}
    fn record_saga_duration(&self, _saga_name: &str, _duration: Duration) {}
    fn record_saga_step_duration(&self, _saga_name: &str, _step_count: usize, _duration: Duration) {}
    fn record_message_operation(&self, _message_type: &str, _operation: &str, _status: &str) {}
    fn record_message_duration(&self, _message_type: &str, _operation: &str, _duration: Duration) {}
    fn record_health_check_duration(&self, _duration: Duration) {}
    fn record_memory_usage(&self, _bytes: u64) {}
    fn record_active_connections(&self, _count: i64) {}
}
