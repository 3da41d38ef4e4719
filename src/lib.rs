#![forbid(unsafe_code)]

//! Resilience and saga orchestration core for services that coordinate
//! multi-step business operations over unreliable networks.
//!
//! ## Features
//!
//! - **Retry policies** with backoff strategies (constant, linear, exponential) and jitter
//! - **Circuit breakers** using a sliding failure-ratio window, not a bare consecutive count
//! - **Timeout policies** integrated with tokio, cancellation-aware
//! - **Policy composition** via builder pattern (Retry → CircuitBreaker → Timeout)
//! - **A resilient HTTP transport** built on the same stack
//! - **An AMQP-backed message bus** with at-least-once delivery and request/reply
//! - **A saga orchestrator** for ordered, compensatable multi-step workflows
//! - **Lock-free implementations** using atomics where the hot path allows it
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ninelives::{
//!     Backoff, CircuitBreakerPolicy, Jitter, ResilienceError, ResilienceStack,
//!     ResilienceStackBuilder, RetryPolicy, TimeoutPolicy,
//! };
//!
//! async fn flaky_operation(
//!     attempts: Arc<AtomicUsize>,
//! ) -> Result<(), ResilienceError<std::io::Error>> {
//!     let n = attempts.fetch_add(1, Ordering::Relaxed);
//!     if n < 2 {
//!         Err(ResilienceError::Inner(std::io::Error::new(
//!             std::io::ErrorKind::Other,
//!             "transient failure",
//!         )))
//!     } else {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError<std::io::Error>> {
//!     let attempts = Arc::new(AtomicUsize::new(0));
//!
//!     let retry = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .expect("max_attempts > 0")
//!         .backoff(Backoff::exponential(Duration::from_millis(200)))
//!         .with_jitter(Jitter::full())
//!         .build();
//!
//!     // Compose via the stack builder (Retry → CircuitBreaker → Timeout).
//!     let stack: ResilienceStack<std::io::Error> = ResilienceStackBuilder::new()
//!         .retry(retry)
//!         .circuit_breaker(5, Duration::from_secs(30))
//!         .timeout(Duration::from_secs(2))
//!         .build()
//!         .expect("valid stack");
//!
//!     stack.execute(|| flaky_operation(attempts.clone())).await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod bus;
mod circuit_breaker;
mod clock;
pub mod config;
mod error;
mod jitter;
mod retry;
mod saga;
mod sleeper;
mod stack;
pub mod telemetry;
mod timeout;
mod transport;

// Re-exports
pub use backoff::Backoff;
pub use bus::{
    AmqpMessageBus, BusError, BusMessage, Envelope, InProcessBus, MessageBus, MessageHandler,
    ReceivedMessage, Subscription,
};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitState};
pub use clock::{Clock, MonotonicClock};
pub use config::Config;
pub use error::{ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use retry::{BuildError, RetryLayer, RetryPolicy, RetryPolicyBuilder, RetryService};
pub use saga::{
    SagaDefinition, SagaDefinitionError, SagaInstance, SagaOrchestrator, SagaOutcome, SagaStatus,
    SagaStep, StepOutcome,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stack::{ResilienceStack, ResilienceStackBuilder, StackError};
pub use telemetry::{Metrics, NoopMetrics, NoopTracing, Tracing, TracingSpan};
pub use timeout::{TimeoutError, TimeoutPolicy, MAX_TIMEOUT};
pub use transport::{HttpTransport, ResilientTransport, TransportError};

pub mod prelude;
