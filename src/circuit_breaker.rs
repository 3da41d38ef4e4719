//! Circuit breaker implementation: a sliding time window of call outcomes
//! decides admission by failure *ratio*, not by consecutive failure count.

use crate::clock::{Clock, MonotonicClock};
use crate::ResilienceError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Upper bound on samples retained in the sliding window, regardless of
/// `samplingDuration`, so a misconfigured window can't grow unbounded under
/// very high call volume.
const MAX_WINDOW_SAMPLES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Configuration for the sliding-window failure-ratio breaker.
#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Failure ratio in (0, 1] that trips the breaker once `minimum_throughput`
    /// samples exist within `sampling_duration`.
    pub failure_ratio: f64,
    /// Width of the sliding window over which the failure ratio is computed.
    pub sampling_duration: Duration,
    /// Minimum number of samples within the window before the ratio is evaluated.
    pub minimum_throughput: usize,
    /// How long the breaker stays Open before admitting a HalfOpen probe.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_duration: Duration::from_secs(10),
            minimum_throughput: 3,
            break_duration: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never trips: minimum_throughput is unreachable.
    pub fn disabled() -> Self {
        Self { minimum_throughput: usize::MAX, ..Self::default() }
    }
}

struct Sample {
    at_millis: u64,
    failed: bool,
}

struct CircuitBreakerState {
    state: AtomicU8,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
    window: Mutex<VecDeque<Sample>>,
}

impl CircuitBreakerState {
    fn record(&self, now_millis: u64, window: Duration, failed: bool) {
        let mut guard = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = now_millis.saturating_sub(window.as_millis() as u64);
        while guard.front().is_some_and(|s| s.at_millis < cutoff) {
            guard.pop_front();
        }
        if guard.len() >= MAX_WINDOW_SAMPLES {
            guard.pop_front();
        }
        guard.push_back(Sample { at_millis: now_millis, failed });
    }

    /// Returns (sample_count, failure_count) within the window as of `now_millis`.
    fn snapshot(&self, now_millis: u64, window: Duration) -> (usize, usize) {
        let mut guard = self.window.lock().unwrap_or_else(|p| p.into_inner());
        let cutoff = now_millis.saturating_sub(window.as_millis() as u64);
        while guard.front().is_some_and(|s| s.at_millis < cutoff) {
            guard.pop_front();
        }
        let failures = guard.iter().filter(|s| s.failed).count();
        (guard.len(), failures)
    }
}

#[derive(Clone)]
pub struct CircuitBreakerPolicy {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerPolicy {
    /// Construct with the default config, overriding only `failure_ratio` is
    /// rarely what's wanted directly; most callers should use [`Self::with_config`].
    pub fn new(minimum_throughput: usize, break_duration: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig {
            minimum_throughput,
            break_duration,
            ..CircuitBreakerConfig::default()
        })
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState {
                state: AtomicU8::new(STATE_CLOSED),
                opened_at_millis: AtomicU64::new(0),
                half_open_calls: AtomicUsize::new(0),
                window: Mutex::new(VecDeque::new()),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests)
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The breaker's current state, read from the real atomic — never
    /// hardcoded to `Closed`.
    pub fn current_state(&self) -> CircuitState {
        match self.state.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub async fn execute<T, E, Fut, Op>(&self, mut operation: Op) -> Result<T, ResilienceError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        loop {
            let current_state = self.state.state.load(Ordering::Acquire);

            match current_state {
                STATE_OPEN => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);

                    if elapsed >= self.config.break_duration.as_millis() as u64 {
                        match self.state.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                tracing::info!("Circuit breaker → half-open");
                                self.state.half_open_calls.store(1, Ordering::Release);
                                break;
                            }
                            Err(STATE_HALF_OPEN) => continue,
                            Err(STATE_CLOSED) => break,
                            Err(_) => unreachable!("Invalid state transition"),
                        }
                    } else {
                        let (_, failures) =
                            self.state.snapshot(now, self.config.sampling_duration);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: failures,
                            open_duration: Duration::from_millis(elapsed),
                        });
                    }
                }
                STATE_HALF_OPEN => {
                    // Only one probe is admitted per recovery cycle.
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= 1 {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        return Err(ResilienceError::CircuitOpen {
                            failure_count: 0,
                            open_duration: Duration::from_millis(0),
                        });
                    }
                    tracing::debug!("Circuit breaker: half-open probe admitted");
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("Invalid circuit breaker state"),
            }
        }

        let was_half_open = self.state.state.load(Ordering::Acquire) == STATE_HALF_OPEN;
        let result = operation().await;

        if was_half_open {
            self.state.half_open_calls.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(was_half_open),
            Err(_) => self.on_failure(was_half_open),
        }

        result
    }

    fn on_success(&self, was_half_open: bool) {
        let now = self.now_millis();
        self.state.record(now, self.config.sampling_duration, false);

        if was_half_open
            && self
                .state
                .state
                .compare_exchange(
                    STATE_HALF_OPEN,
                    STATE_CLOSED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.state.opened_at_millis.store(0, Ordering::Release);
            tracing::info!("Circuit breaker → closed");
        }
    }

    fn on_failure(&self, was_half_open: bool) {
        let now = self.now_millis();

        if was_half_open {
            if self
                .state
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.state.opened_at_millis.store(now, Ordering::Release);
                tracing::warn!("Circuit breaker: probe failed → open");
            }
            return;
        }

        self.state.record(now, self.config.sampling_duration, true);
        let (samples, failures) = self.state.snapshot(now, self.config.sampling_duration);

        if samples >= self.config.minimum_throughput {
            let ratio = failures as f64 / samples as f64;
            if ratio >= self.config.failure_ratio
                && self
                    .state
                    .state
                    .compare_exchange(
                        STATE_CLOSED,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                self.state.opened_at_millis.store(now, Ordering::Release);
                tracing::error!(
                    failures,
                    samples,
                    ratio,
                    threshold = self.config.failure_ratio,
                    "Circuit breaker → open"
                );
            }
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}
