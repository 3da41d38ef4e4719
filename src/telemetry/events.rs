use std::fmt;
use std::time::Duration;

use serde_json::json;

/// Policy events emitted during execution.
///
/// All resilience policies emit structured events that describe their behavior.
/// These events can be collected, aggregated, and used for observability,
/// monitoring, or autonomous control.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    /// Retry policy events
    Retry(RetryEvent),
    /// Circuit breaker events
    CircuitBreaker(CircuitBreakerEvent),
    /// Timeout events
    Timeout(TimeoutEvent),
    /// Request outcome events (emitted by all policies)
    Request(RequestOutcome),
    /// Saga orchestration events
    Saga(SagaEvent),
    /// Message bus events
    Bus(BusEvent),
}

/// Events emitted by retry policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A retry attempt is about to be made.
    ///
    /// Emitted before sleeping and retrying a failed request.
    Attempt {
        /// The attempt number (1-indexed)
        attempt: usize,
        /// The backoff delay before this retry
        delay: Duration,
    },
    /// All retry attempts have been exhausted.
    ///
    /// Emitted when the maximum number of retries is reached
    /// and the request still fails.
    Exhausted {
        /// Total number of attempts made
        total_attempts: usize,
        /// Total time spent retrying
        total_duration: Duration,
    },
}

/// Events emitted by circuit breaker policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Circuit transitioned to open state.
    ///
    /// Subsequent requests will be rejected immediately without
    /// being forwarded to the inner service.
    Opened {
        /// Number of failures in the sampling window that triggered the open
        failure_count: usize,
    },
    /// Circuit transitioned to half-open state.
    ///
    /// A limited number of test requests will be allowed through
    /// to determine if the inner service has recovered.
    HalfOpen,
    /// Circuit transitioned to closed state.
    ///
    /// Normal operation resumes - all requests are forwarded.
    Closed,
}

/// Events emitted by timeout policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    /// A request exceeded the timeout duration.
    ///
    /// The request was cancelled and an error returned.
    Occurred {
        /// The timeout duration that was exceeded
        timeout: Duration,
    },
}

/// Request outcome events emitted by all policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request completed successfully.
    Success {
        /// Time taken to complete the request
        duration: Duration,
    },
    /// Request failed with an error.
    Failure {
        /// Time taken before failure
        duration: Duration,
    },
}

/// Events emitted by the saga orchestrator as an instance progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaEvent {
    /// A saga instance started executing.
    Started { saga_name: &'static str, step_count: usize },
    /// A single step completed successfully.
    StepSucceeded { saga_name: &'static str, step_name: &'static str },
    /// A single step failed.
    StepFailed { saga_name: &'static str, step_name: &'static str },
    /// Compensation began after a step failure or cancellation.
    CompensationStarted { saga_name: &'static str, from_step: &'static str },
    /// A compensating action ran for one previously-completed step.
    StepCompensated { saga_name: &'static str, step_name: &'static str },
    /// The saga finished, successfully or not.
    Completed { saga_name: &'static str, result: SagaResultKind, duration: Duration },
}

/// Coarse outcome classification for a finished saga, used for metrics tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaResultKind {
    Completed,
    Compensated,
    CompensationFailed,
    Cancelled,
}

impl SagaResultKind {
    /// The `result` tag value recorded on `saga_executions_total`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaResultKind::Completed => "completed",
            SagaResultKind::Compensated => "compensated",
            SagaResultKind::CompensationFailed => "compensation_failed",
            SagaResultKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SagaResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Events emitted by the message bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A message was published to an exchange/topic.
    Published { message_type: &'static str },
    /// A message was received off a subscribed queue.
    Received { message_type: &'static str },
    /// A handler acked a message.
    Acked { message_type: &'static str },
    /// A handler rejected a message (with or without requeue).
    Rejected { message_type: &'static str, requeued: bool },
    /// The bus connection was lost and is attempting to reconnect.
    Disconnected,
    /// The bus connection (and topology) was re-established.
    Reconnected,
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::Retry(event) => write!(f, "Retry::{}", event),
            PolicyEvent::CircuitBreaker(event) => write!(f, "CircuitBreaker::{}", event),
            PolicyEvent::Timeout(event) => write!(f, "Timeout::{}", event),
            PolicyEvent::Request(event) => write!(f, "Request::{}", event),
            PolicyEvent::Saga(event) => write!(f, "Saga::{}", event),
            PolicyEvent::Bus(event) => write!(f, "Bus::{}", event),
        }
    }
}

impl fmt::Display for RetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryEvent::Attempt { attempt, delay } => {
                write!(f, "Attempt(#{}, delay={:?})", attempt, delay)
            }
            RetryEvent::Exhausted { total_attempts, total_duration } => {
                write!(f, "Exhausted(attempts={}, duration={:?})", total_attempts, total_duration)
            }
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for TimeoutEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutEvent::Occurred { timeout } => write!(f, "Occurred(timeout={:?})", timeout),
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { duration } => write!(f, "Success(duration={:?})", duration),
            RequestOutcome::Failure { duration } => write!(f, "Failure(duration={:?})", duration),
        }
    }
}

impl fmt::Display for SagaEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SagaEvent::Started { saga_name, step_count } => {
                write!(f, "Started({saga_name}, steps={step_count})")
            }
            SagaEvent::StepSucceeded { saga_name, step_name } => {
                write!(f, "StepSucceeded({saga_name}::{step_name})")
            }
            SagaEvent::StepFailed { saga_name, step_name } => {
                write!(f, "StepFailed({saga_name}::{step_name})")
            }
            SagaEvent::CompensationStarted { saga_name, from_step } => {
                write!(f, "CompensationStarted({saga_name}, from={from_step})")
            }
            SagaEvent::StepCompensated { saga_name, step_name } => {
                write!(f, "StepCompensated({saga_name}::{step_name})")
            }
            SagaEvent::Completed { saga_name, result, duration } => {
                write!(f, "Completed({saga_name}, result={result}, duration={duration:?})")
            }
        }
    }
}

impl fmt::Display for BusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusEvent::Published { message_type } => write!(f, "Published({message_type})"),
            BusEvent::Received { message_type } => write!(f, "Received({message_type})"),
            BusEvent::Acked { message_type } => write!(f, "Acked({message_type})"),
            BusEvent::Rejected { message_type, requeued } => {
                write!(f, "Rejected({message_type}, requeued={requeued})")
            }
            BusEvent::Disconnected => write!(f, "Disconnected"),
            BusEvent::Reconnected => write!(f, "Reconnected"),
        }
    }
}

#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a PolicyEvent into a JSON value, for sinks that export structured logs.
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    match event {
        PolicyEvent::Retry(r) => match r {
            RetryEvent::Attempt { attempt, delay } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "delay_ms": clamp_u64(delay.as_millis()),
            }),
            RetryEvent::Exhausted { total_attempts, total_duration } => json!({
                "kind": "retry_exhausted",
                "attempts": *total_attempts,
                "duration_ms": clamp_u64(total_duration.as_millis()),
            }),
        },
        PolicyEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { failure_count } => {
                json!({ "kind": "circuit_opened", "failures": *failure_count })
            }
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
        },
        PolicyEvent::Timeout(t) => match t {
            TimeoutEvent::Occurred { timeout } => json!({
                "kind": "timeout",
                "timeout_ms": clamp_u64(timeout.as_millis())
            }),
        },
        PolicyEvent::Request(r) => match r {
            RequestOutcome::Success { duration } => json!({
                "kind": "request_success",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
            RequestOutcome::Failure { duration } => json!({
                "kind": "request_failure",
                "duration_ms": clamp_u64(duration.as_millis())
            }),
        },
        PolicyEvent::Saga(s) => match s {
            SagaEvent::Started { saga_name, step_count } => json!({
                "kind": "saga_started",
                "saga": saga_name,
                "steps": *step_count,
            }),
            SagaEvent::StepSucceeded { saga_name, step_name } => json!({
                "kind": "saga_step_succeeded",
                "saga": saga_name,
                "step": step_name,
            }),
            SagaEvent::StepFailed { saga_name, step_name } => json!({
                "kind": "saga_step_failed",
                "saga": saga_name,
                "step": step_name,
            }),
            SagaEvent::CompensationStarted { saga_name, from_step } => json!({
                "kind": "saga_compensation_started",
                "saga": saga_name,
                "from_step": from_step,
            }),
            SagaEvent::StepCompensated { saga_name, step_name } => json!({
                "kind": "saga_step_compensated",
                "saga": saga_name,
                "step": step_name,
            }),
            SagaEvent::Completed { saga_name, result, duration } => json!({
                "kind": "saga_completed",
                "saga": saga_name,
                "result": result.to_string(),
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
        },
        PolicyEvent::Bus(b) => match b {
            BusEvent::Published { message_type } => json!({
                "kind": "bus_published",
                "message_type": message_type,
            }),
            BusEvent::Received { message_type } => json!({
                "kind": "bus_received",
                "message_type": message_type,
            }),
            BusEvent::Acked { message_type } => json!({
                "kind": "bus_acked",
                "message_type": message_type,
            }),
            BusEvent::Rejected { message_type, requeued } => json!({
                "kind": "bus_rejected",
                "message_type": message_type,
                "requeued": *requeued,
            }),
            BusEvent::Disconnected => json!({ "kind": "bus_disconnected" }),
            BusEvent::Reconnected => json!({ "kind": "bus_reconnected" }),
        },
    }
}
