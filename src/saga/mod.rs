//! Saga orchestration: ordered steps with forward execution and inverse
//! compensation, run by a central orchestrator rather than choreographed
//! between participants.
//!
//! A [`SagaDefinition`] is an ordered list of [`SagaStep`]s. [`SagaOrchestrator`]
//! runs them in order against a shared payload; if a step fails with a
//! compensatable outcome, every successful step so far (plus that failing
//! step, if it made partial progress) is compensated in reverse order.
//! Compensation always runs to completion: one step's compensation failing
//! does not stop the others from running, and always happens under a fresh,
//! non-cancellable [`CancellationToken`] even if the saga itself was
//! cancelled mid-flight.

use crate::telemetry::{
    emit_best_effort, Metrics, NoopMetrics, NullSink, PolicyEvent, SagaEvent, SagaResultKind,
    TelemetrySink,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// The outcome of running a single step's `execute` or `compensate`.
#[derive(Debug)]
pub enum StepOutcome {
    Success,
    Failure {
        reason: String,
        cause: Option<Box<dyn StdError + Send + Sync>>,
        /// Whether this step made enough partial progress that it must be
        /// compensated even though it reports failure.
        compensatable: bool,
    },
}

impl StepOutcome {
    pub fn success() -> Self {
        Self::Success
    }

    /// A pure validation failure: nothing happened, so there is nothing to
    /// compensate. This is the common case.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure { reason: reason.into(), cause: None, compensatable: false }
    }

    /// A failure that occurred after partial side effects, so the step must
    /// still be compensated even though it did not succeed.
    pub fn failure_partial(reason: impl Into<String>) -> Self {
        Self::Failure { reason: reason.into(), cause: None, compensatable: true }
    }

    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        if let Self::Failure { cause: c, .. } = &mut self {
            *c = Some(Box::new(cause));
        }
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A single step in a saga: a forward action and its inverse.
///
/// `order()` values must be unique within a [`SagaDefinition`]; steps run in
/// ascending order, and compensation runs in descending order over whichever
/// steps actually need it.
#[async_trait]
pub trait SagaStep<T>: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self) -> u32;

    async fn execute(&self, payload: &mut T, ctx: &CancellationToken) -> StepOutcome;

    async fn compensate(&self, payload: &mut T, ctx: &CancellationToken) -> StepOutcome;
}

/// Error constructing a [`SagaDefinition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaDefinitionError {
    DuplicateOrder(u32),
    Empty,
}

impl fmt::Display for SagaDefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateOrder(order) => write!(f, "duplicate step order: {order}"),
            Self::Empty => write!(f, "a saga definition needs at least one step"),
        }
    }
}

impl StdError for SagaDefinitionError {}

/// An ordered, validated set of steps that make up one kind of saga.
pub struct SagaDefinition<T> {
    name: &'static str,
    steps: Vec<Arc<dyn SagaStep<T>>>,
}

impl<T> SagaDefinition<T> {
    /// Build a definition from `steps`, sorting them by `order()`.
    ///
    /// Returns [`SagaDefinitionError::DuplicateOrder`] if two steps share an
    /// `order()` value, and [`SagaDefinitionError::Empty`] if `steps` is
    /// empty.
    pub fn new(
        name: &'static str,
        mut steps: Vec<Arc<dyn SagaStep<T>>>,
    ) -> Result<Self, SagaDefinitionError> {
        if steps.is_empty() {
            return Err(SagaDefinitionError::Empty);
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.order()) {
                return Err(SagaDefinitionError::DuplicateOrder(step.order()));
            }
        }

        steps.sort_by_key(|s| s.order());
        Ok(Self { name, steps })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Terminal status of a saga run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Pending,
    Succeeded,
    Compensated,
    CompensationFailed,
    Cancelled,
}

/// The result of running a saga to completion, alongside its final status.
#[derive(Debug)]
pub enum SagaOutcome {
    /// Every step succeeded.
    Success { executed: usize },
    /// A step failed and every step requiring compensation was compensated
    /// successfully.
    Compensated { failed_step: &'static str, reason: String },
    /// A step failed and at least one compensation also failed; the payload
    /// may be left in a partially-undone state requiring manual attention.
    CompensationFailed { failed_step: &'static str, reason: String, compensation_failures: Vec<String> },
    /// The saga was cancelled before reaching a terminal step outcome.
    /// Whatever had already succeeded was compensated.
    Cancelled,
}

impl SagaOutcome {
    pub fn status(&self) -> SagaStatus {
        match self {
            Self::Success { .. } => SagaStatus::Succeeded,
            Self::Compensated { .. } => SagaStatus::Compensated,
            Self::CompensationFailed { .. } => SagaStatus::CompensationFailed,
            Self::Cancelled => SagaStatus::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A saga run in progress or finished: the payload plus whatever outcome has
/// been reached so far.
pub struct SagaInstance<T> {
    pub payload: T,
    pub outcome: Option<SagaOutcome>,
}

impl<T> SagaInstance<T> {
    pub fn new(payload: T) -> Self {
        Self { payload, outcome: None }
    }
}

/// Runs a [`SagaDefinition`] against a payload, handling ordering, failure
/// detection, and reverse-order compensation.
///
/// `Sink` receives [`PolicyEvent::Saga`] events for every lifecycle
/// transition; it defaults to [`NullSink`], which drops them.
pub struct SagaOrchestrator<T, Sink = NullSink> {
    definition: Arc<SagaDefinition<T>>,
    metrics: Arc<dyn Metrics>,
    sink: Sink,
}

impl<T> SagaOrchestrator<T, NullSink> {
    pub fn new(definition: Arc<SagaDefinition<T>>) -> Self {
        Self { definition, metrics: Arc::new(NoopMetrics), sink: NullSink }
    }
}

impl<T, Sink> SagaOrchestrator<T, Sink>
where
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
{
    pub fn with_sink(definition: Arc<SagaDefinition<T>>, metrics: Arc<dyn Metrics>, sink: Sink) -> Self {
        Self { definition, metrics, sink }
    }

    /// Run the saga to completion with no external cancellation context.
    pub async fn execute(&self, payload: T) -> SagaInstance<T> {
        self.execute_cancellable(payload, &CancellationToken::new()).await
    }

    /// Run the saga to completion, checking `ctx` for cancellation before
    /// and after each step. A step whose `execute()` returns after the saga
    /// was cancelled mid-call still has its outcome recorded normally (a
    /// step that ran is never left uncompensated); no further step is
    /// launched, and the saga proceeds straight to compensating whatever
    /// has executed so far.
    pub async fn execute_cancellable(&self, mut payload: T, ctx: &CancellationToken) -> SagaInstance<T> {
        let start = Instant::now();
        emit_best_effort(
            self.sink.clone(),
            PolicyEvent::Saga(SagaEvent::Started {
                saga_name: self.definition.name,
                step_count: self.definition.step_count(),
            }),
        )
        .await;

        let mut executed: Vec<&'static str> = Vec::new();
        let mut to_compensate: Vec<&'static str> = Vec::new();
        let mut failure: Option<(&'static str, String)> = None;
        let mut cancelled = false;

        for step in &self.definition.steps {
            if ctx.is_cancelled() {
                cancelled = true;
                break;
            }

            let step_start = Instant::now();
            let outcome = step.execute(&mut payload, ctx).await;
            self.metrics.record_saga_step_duration(
                self.definition.name,
                step.order() as usize,
                step_start.elapsed(),
            );
            let cancelled_during = ctx.is_cancelled();

            // The step actually ran, so whatever it reports is recorded for
            // compensation regardless of whether cancellation raced with its
            // completion: a step that executed is never left uncompensated.
            match outcome {
                StepOutcome::Success => {
                    executed.push(step.name());
                    to_compensate.push(step.name());
                    emit_best_effort(
                        self.sink.clone(),
                        PolicyEvent::Saga(SagaEvent::StepSucceeded {
                            saga_name: self.definition.name,
                            step_name: step.name(),
                        }),
                    )
                    .await;
                }
                StepOutcome::Failure { reason, compensatable, .. } => {
                    emit_best_effort(
                        self.sink.clone(),
                        PolicyEvent::Saga(SagaEvent::StepFailed {
                            saga_name: self.definition.name,
                            step_name: step.name(),
                        }),
                    )
                    .await;
                    if compensatable {
                        to_compensate.push(step.name());
                    }
                    failure = Some((step.name(), reason));
                }
            }

            if cancelled_during {
                cancelled = true;
                break;
            }
            if failure.is_some() {
                break;
            }
        }

        let outcome = if cancelled {
            self.run_compensation(&mut payload, &to_compensate).await;
            SagaOutcome::Cancelled
        } else if let Some((failed_step, reason)) = failure {
            let compensation_failures = self.run_compensation(&mut payload, &to_compensate).await;
            if compensation_failures.is_empty() {
                SagaOutcome::Compensated { failed_step, reason }
            } else {
                SagaOutcome::CompensationFailed { failed_step, reason, compensation_failures }
            }
        } else {
            SagaOutcome::Success { executed: executed.len() }
        };

        let result_kind = match &outcome {
            SagaOutcome::Success { .. } => SagaResultKind::Completed,
            SagaOutcome::Compensated { .. } => SagaResultKind::Compensated,
            SagaOutcome::CompensationFailed { .. } => SagaResultKind::CompensationFailed,
            SagaOutcome::Cancelled => SagaResultKind::Cancelled,
        };
        self.metrics.record_saga_execution(self.definition.name, result_kind.as_str());
        self.metrics.record_saga_duration(self.definition.name, start.elapsed());
        emit_best_effort(
            self.sink.clone(),
            PolicyEvent::Saga(SagaEvent::Completed {
                saga_name: self.definition.name,
                result: result_kind,
                duration: start.elapsed(),
            }),
        )
        .await;

        SagaInstance { payload, outcome: Some(outcome) }
    }

    /// Compensate `to_compensate` in reverse order under a fresh,
    /// non-cancellable token. Returns the reasons for any compensation
    /// failures; an individual failure does not stop the remaining steps
    /// from being compensated.
    async fn run_compensation(&self, payload: &mut T, to_compensate: &[&'static str]) -> Vec<String> {
        if to_compensate.is_empty() {
            return Vec::new();
        }

        emit_best_effort(
            self.sink.clone(),
            PolicyEvent::Saga(SagaEvent::CompensationStarted {
                saga_name: self.definition.name,
                from_step: to_compensate.last().copied().unwrap_or(""),
            }),
        )
        .await;

        let compensation_ctx = CancellationToken::new();
        let mut failures = Vec::new();

        for step_name in to_compensate.iter().rev() {
            let Some(step) = self.definition.steps.iter().find(|s| s.name() == *step_name) else {
                continue;
            };

            match step.compensate(payload, &compensation_ctx).await {
                StepOutcome::Success => {
                    emit_best_effort(
                        self.sink.clone(),
                        PolicyEvent::Saga(SagaEvent::StepCompensated {
                            saga_name: self.definition.name,
                            step_name: step.name(),
                        }),
                    )
                    .await;
                }
                StepOutcome::Failure { reason, .. } => {
                    tracing::error!(saga = %self.definition.name, step = %step.name(), reason = %reason, "compensation failed");
                    failures.push(format!("{}: {}", step.name(), reason));
                }
            }
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Ledger {
        payload: Vec<String>,
    }

    struct RecordingStep {
        name: &'static str,
        order: u32,
        fail: bool,
        compensatable_on_fail: bool,
        compensation_fails: bool,
        execute_calls: Arc<AtomicUsize>,
        compensate_calls: Arc<AtomicUsize>,
    }

    impl RecordingStep {
        fn new(name: &'static str, order: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                order,
                fail: false,
                compensatable_on_fail: false,
                compensation_fails: false,
                execute_calls: Arc::new(AtomicUsize::new(0)),
                compensate_calls: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn failing(name: &'static str, order: u32, compensatable: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                order,
                fail: true,
                compensatable_on_fail: compensatable,
                compensation_fails: false,
                execute_calls: Arc::new(AtomicUsize::new(0)),
                compensate_calls: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl SagaStep<Ledger> for RecordingStep {
        fn name(&self) -> &'static str {
            self.name
        }

        fn order(&self) -> u32 {
            self.order
        }

        async fn execute(&self, payload: &mut Ledger, _ctx: &CancellationToken) -> StepOutcome {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                if self.compensatable_on_fail {
                    StepOutcome::failure_partial(format!("{} failed", self.name))
                } else {
                    StepOutcome::failure(format!("{} failed", self.name))
                }
            } else {
                payload.payload.push(self.name.to_string());
                StepOutcome::success()
            }
        }

        async fn compensate(&self, payload: &mut Ledger, _ctx: &CancellationToken) -> StepOutcome {
            self.compensate_calls.fetch_add(1, Ordering::SeqCst);
            payload.payload.retain(|s| s != self.name);
            if self.compensation_fails {
                StepOutcome::failure(format!("{} compensation failed", self.name))
            } else {
                StepOutcome::success()
            }
        }
    }

    fn orchestrator(
        steps: Vec<Arc<dyn SagaStep<Ledger>>>,
    ) -> SagaOrchestrator<Ledger, crate::telemetry::MemorySink> {
        let definition = Arc::new(SagaDefinition::new("test-saga", steps).unwrap());
        SagaOrchestrator::with_sink(definition, Arc::new(NoopMetrics), crate::telemetry::MemorySink::new())
    }

    #[tokio::test]
    async fn happy_path_runs_every_step_in_order() {
        let a = RecordingStep::new("reserve", 1);
        let b = RecordingStep::new("charge", 2);
        let c = RecordingStep::new("ship", 3);
        let orch = orchestrator(vec![a, b, c]);

        let instance = orch.execute(Ledger::default()).await;
        assert!(matches!(instance.outcome, Some(SagaOutcome::Success { executed: 3 })));
        assert_eq!(instance.payload.payload, vec!["reserve", "charge", "ship"]);
    }

    #[tokio::test]
    async fn non_compensatable_failure_only_compensates_prior_steps() {
        let a = RecordingStep::new("reserve", 1);
        let b = RecordingStep::new("charge", 2);
        let failing = RecordingStep::failing("validate_address", 3, false);
        let failing_calls = failing.compensate_calls.clone();
        let orch = orchestrator(vec![a, b, failing]);

        let instance = orch.execute(Ledger::default()).await;
        match instance.outcome.unwrap() {
            SagaOutcome::Compensated { failed_step, .. } => assert_eq!(failed_step, "validate_address"),
            other => panic!("expected Compensated, got {other:?}"),
        }
        // The failing step itself is not compensated since it made no progress.
        assert_eq!(failing_calls.load(Ordering::SeqCst), 0);
        assert!(instance.payload.payload.is_empty());
    }

    #[tokio::test]
    async fn compensatable_failure_also_compensates_the_failing_step() {
        let a = RecordingStep::new("reserve", 1);
        let failing = RecordingStep::failing("charge", 2, true);
        let failing_calls = failing.compensate_calls.clone();
        let orch = orchestrator(vec![a, failing]);

        let _ = orch.execute(Ledger::default()).await;
        assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn compensation_failure_is_reported_but_does_not_abort_remaining_compensations() {
        let a = Arc::new(RecordingStep {
            name: "reserve",
            order: 1,
            fail: false,
            compensatable_on_fail: false,
            compensation_fails: true,
            execute_calls: Arc::new(AtomicUsize::new(0)),
            compensate_calls: Arc::new(AtomicUsize::new(0)),
        });
        let a_compensate_calls = a.compensate_calls.clone();
        let b = RecordingStep::new("charge", 2);
        let b_compensate_calls = b.compensate_calls.clone();
        let failing = RecordingStep::failing("ship", 3, false);
        let orch = orchestrator(vec![a, b, failing]);

        let instance = orch.execute(Ledger::default()).await;
        assert!(matches!(instance.outcome, Some(SagaOutcome::CompensationFailed { .. })));
        assert_eq!(a_compensate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_compensate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_before_a_step_compensates_what_already_succeeded() {
        let a = RecordingStep::new("reserve", 1);
        let b = RecordingStep::new("charge", 2);
        let b_calls = b.execute_calls.clone();
        let orch = orchestrator(vec![a, b]);

        let ctx = CancellationToken::new();
        ctx.cancel();
        let instance = orch.execute_cancellable(Ledger::default(), &ctx).await;

        assert!(matches!(instance.outcome, Some(SagaOutcome::Cancelled)));
        // Cancelled before the loop even ran the first step.
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);
    }

    struct CancelsMidExecute {
        token: CancellationToken,
    }

    #[async_trait]
    impl SagaStep<Ledger> for CancelsMidExecute {
        fn name(&self) -> &'static str {
            "cancels_mid_flight"
        }

        fn order(&self) -> u32 {
            1
        }

        async fn execute(&self, payload: &mut Ledger, _ctx: &CancellationToken) -> StepOutcome {
            self.token.cancel();
            payload.payload.push("mid-flight-side-effect".to_string());
            StepOutcome::success()
        }

        async fn compensate(&self, payload: &mut Ledger, _ctx: &CancellationToken) -> StepOutcome {
            payload.payload.retain(|s| s != "mid-flight-side-effect");
            StepOutcome::success()
        }
    }

    #[tokio::test]
    async fn step_that_cancels_while_executing_is_still_compensated() {
        let ctx = CancellationToken::new();
        let step = Arc::new(CancelsMidExecute { token: ctx.clone() });
        let orch = orchestrator(vec![step]);

        let instance = orch.execute_cancellable(Ledger::default(), &ctx).await;
        assert!(matches!(instance.outcome, Some(SagaOutcome::Cancelled)));
        // The step actually ran and recorded a side effect before
        // cancellation was observed, so it is compensated like any other
        // executed step; no side effect is left dangling.
        assert!(instance.payload.payload.is_empty());
    }

    #[test]
    fn duplicate_order_is_rejected() {
        let a = RecordingStep::new("a", 1);
        let b = RecordingStep::new("b", 1);
        let err = SagaDefinition::new("dup", vec![a, b]).unwrap_err();
        assert_eq!(err, SagaDefinitionError::DuplicateOrder(1));
    }

    #[test]
    fn empty_definition_is_rejected() {
        let err = SagaDefinition::<Ledger>::new("empty", vec![]).unwrap_err();
        assert_eq!(err, SagaDefinitionError::Empty);
    }

    #[test]
    fn steps_are_sorted_by_order_regardless_of_input_order() {
        let c = RecordingStep::new("c", 3);
        let a = RecordingStep::new("a", 1);
        let b = RecordingStep::new("b", 2);
        let def = SagaDefinition::new("ordered", vec![c, a, b]).unwrap();
        assert_eq!(def.step_count(), 3);
    }

    #[derive(Default)]
    struct RecordingMetrics {
        executions: Mutex<Vec<(String, String)>>,
        saga_durations: Mutex<Vec<String>>,
        step_durations: Mutex<Vec<(String, usize)>>,
    }

    impl Metrics for RecordingMetrics {
        fn record_http_request(&self, _m: &str, _e: &str, _s: u16) {}
        fn record_http_duration(&self, _m: &str, _e: &str, _d: Duration) {}
        fn record_circuit_breaker_transition(&self, _n: &str, _f: &str, _t: &str) {}
        fn record_retry_attempt(&self, _o: &str, _a: u32, _s: bool) {}
        fn record_saga_execution(&self, saga_name: &str, result: &str) {
            self.executions.lock().unwrap().push((saga_name.to_string(), result.to_string()));
        }
        fn record_saga_duration(&self, saga_name: &str, _duration: Duration) {
            self.saga_durations.lock().unwrap().push(saga_name.to_string());
        }
        fn record_saga_step_duration(&self, saga_name: &str, step_count: usize, _duration: Duration) {
            self.step_durations.lock().unwrap().push((saga_name.to_string(), step_count));
        }
        fn record_message_operation(&self, _t: &str, _o: &str, _s: &str) {}
        fn record_message_duration(&self, _t: &str, _o: &str, _d: Duration) {}
        fn record_health_check_duration(&self, _d: Duration) {}
        fn record_memory_usage(&self, _b: u64) {}
        fn record_active_connections(&self, _c: i64) {}
    }

    #[tokio::test]
    async fn completion_records_saga_execution_and_per_step_durations() {
        let a = RecordingStep::new("reserve", 1);
        let b = RecordingStep::new("charge", 2);
        let definition = Arc::new(SagaDefinition::new("checkout", vec![a, b]).unwrap());
        let metrics = Arc::new(RecordingMetrics::default());
        let orch = SagaOrchestrator::with_sink(
            definition,
            metrics.clone(),
            crate::telemetry::MemorySink::new(),
        );

        let instance = orch.execute(Ledger::default()).await;
        assert!(matches!(instance.outcome, Some(SagaOutcome::Success { .. })));

        assert_eq!(
            metrics.executions.lock().unwrap().clone(),
            vec![("checkout".to_string(), "completed".to_string())]
        );
        assert_eq!(metrics.saga_durations.lock().unwrap().clone(), vec!["checkout".to_string()]);
        assert_eq!(
            metrics.step_durations.lock().unwrap().clone(),
            vec![("checkout".to_string(), 1), ("checkout".to_string(), 2)]
        );
    }
}
