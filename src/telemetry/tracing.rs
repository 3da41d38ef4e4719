//! Distributed tracing seams, kept separate from metrics so a caller can
//! swap either independently (e.g. ship traces to Jaeger but metrics to
//! Prometheus).

/// A tracing backend capable of starting spans around resilience and saga
/// operations. Default implementation is a no-op so the crate has zero
/// tracing overhead unless a caller opts in.
pub trait Tracing: Send + Sync + 'static {
    /// The span handle type; dropping it (or calling `finish`) ends the span.
    type Span: TracingSpan;

    /// Start a new span named `name` with the given key/value attributes.
    fn start_span(&self, name: &str, attributes: &[(&str, &str)]) -> Self::Span;
}

/// A single active span. Call [`TracingSpan::record_error`] before dropping
/// if the operation it wraps failed, so the span carries that outcome.
pub trait TracingSpan: Send + 'static {
    /// Attach an error description to this span.
    fn record_error(&mut self, message: &str);

    /// End the span explicitly. Dropping without calling this still ends it.
    fn finish(self);
}

/// No-op tracing backend; spans are zero-sized and do nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracing;

/// Handle returned by [`NoopTracing`]; carries no state.
#[derive(Debug, Default)]
pub struct NoopSpan;

impl Tracing for NoopTracing {
    type Span = NoopSpan;

    fn start_span(&self, _name: &str, _attributes: &[(&str, &str)]) -> Self::Span {
        NoopSpan
    }
}

impl TracingSpan for NoopSpan {
    fn record_error(&mut self, _message: &str) {}
    fn finish(self) {}
}

/// Tracing backend built on the `tracing` crate: each span is a real
/// `tracing::Span`, so it participates in whatever subscriber the host
/// process has installed (fmt, OpenTelemetry, etc).
#[derive(Clone, Copy, Debug, Default)]
pub struct StdTracing;

/// Guard wrapping a live `tracing::Span` plus its entered guard.
pub struct StdTracingSpan {
    span: ::tracing::Span,
    _entered: ::tracing::span::EnteredSpan,
}

impl Tracing for StdTracing {
    type Span = StdTracingSpan;

    fn start_span(&self, name: &str, attributes: &[(&str, &str)]) -> Self::Span {
        let attrs: Vec<String> =
            attributes.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let span = ::tracing::info_span!("ninelives_operation", name = %name, attrs = %attrs.join(","));
        let entered = span.clone().entered();
        StdTracingSpan { span, _entered: entered }
    }
}

impl TracingSpan for StdTracingSpan {
    fn record_error(&mut self, message: &str) {
        ::tracing::warn!(parent: &self.span, error = %message, "operation failed");
    }

    fn finish(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_tracing_is_inert() {
        let tracing = NoopTracing;
        let mut span = tracing.start_span("op", &[("key", "value")]);
        span.record_error("boom");
        span.finish();
    }

    #[test]
    fn std_tracing_produces_a_span() {
        let tracing = StdTracing;
        let mut span = tracing.start_span("saga.step", &[("saga_name", "checkout")]);
        span.record_error("compensating");
        span.finish();
    }
}
