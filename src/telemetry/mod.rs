//! Telemetry and observability for Nine Lives policies.
//!
//! This module provides the event system that enables all policies to emit
//! structured telemetry. Events flow through `TelemetrySink` implementations
//! which can log, aggregate, or forward events to external systems.
//!
//! # Event Types
//!
//! Each policy type emits specific events:
//!
//! - **Retry**: `RetryAttempt`, `RetryExhausted`
//! - **Circuit Breaker**: `CircuitOpened`, `CircuitClosed`, `CircuitHalfOpen`
//! - **Timeout**: `TimeoutOccurred`
//! - **All policies**: `RequestSuccess`, `RequestFailure`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<PolicyEvent>` for composability.

pub mod events;
pub mod metrics;
pub mod sinks;
pub mod tracing;

pub use events::{
    BusEvent, CircuitBreakerEvent, PolicyEvent, RequestOutcome, RetryEvent, SagaEvent,
    SagaResultKind, TimeoutEvent,
};
pub use metrics::{Metrics, NoopMetrics};
pub use sinks::{
    emit_best_effort, ComposedSinkError, FallbackSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink, TelemetrySink,
};
pub use tracing::{NoopTracing, StdTracing, Tracing, TracingSpan};

#[cfg(test)]
mod tests {
    // Note: Tests have been moved to submodules (events.rs and sinks.rs)
}