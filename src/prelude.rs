//! Convenient re-exports for common types.
pub use crate::{
    backoff::Backoff,
    bus::{BusError, BusMessage, Envelope, InProcessBus, MessageBus, ReceivedMessage, Subscription},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState},
    clock::{Clock, MonotonicClock},
    config::Config,
    error::MAX_RETRY_FAILURES,
    jitter::Jitter,
    retry::{BuildError, RetryLayer, RetryPolicy, RetryPolicyBuilder, RetryService},
    saga::{
        SagaDefinition, SagaDefinitionError, SagaInstance, SagaOrchestrator, SagaOutcome,
        SagaStatus, SagaStep, StepOutcome,
    },
    sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper},
    stack::{ResilienceStack, ResilienceStackBuilder, StackError},
    telemetry::{
        BusEvent, CircuitBreakerEvent, FallbackSink, LogSink, MemorySink, Metrics, MulticastSink,
        NoopMetrics, NoopTracing, NullSink, PolicyEvent, RequestOutcome, RetryEvent, SagaEvent,
        StdTracing, StreamingSink, TelemetrySink, TimeoutEvent, Tracing, TracingSpan,
    },
    timeout::{TimeoutError, TimeoutLayer, TimeoutPolicy, TimeoutService, MAX_TIMEOUT},
    transport::{HttpTransport, ResilientTransport, TransportError},
    ResilienceError,
};
