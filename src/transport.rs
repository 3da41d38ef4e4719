//! Resilient HTTP transport: a thin façade wrapping a request function in a
//! [`ResilienceStack`], so a caller gets retry, circuit breaking, and
//! timeout without wiring the stack by hand for every client.

use crate::{BuildError, ResilienceError, ResilienceStack, ResilienceStackBuilder, StackError};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors constructing a [`ResilientTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportBuildError {
    Retry(BuildError),
    Stack(StackError),
}

impl fmt::Display for TransportBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry(e) => write!(f, "invalid retry configuration: {e}"),
            Self::Stack(e) => write!(f, "invalid stack configuration: {e}"),
        }
    }
}

impl std::error::Error for TransportBuildError {}

impl From<BuildError> for TransportBuildError {
    fn from(e: BuildError) -> Self {
        Self::Retry(e)
    }
}

impl From<StackError> for TransportBuildError {
    fn from(e: StackError) -> Self {
        Self::Stack(e)
    }
}

/// Errors a [`ResilientTransport`] can surface, distinguishing an HTTP
/// status response (the peer answered, just not happily) from a
/// connection-level failure (the peer never answered at all).
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The peer responded with a status code of 400 or above.
    Status { code: u16, body: String },
    /// The request never completed: DNS, connect, TLS, or read/write failure.
    Connection(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status { code, body } => write!(f, "HTTP {code}: {body}"),
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl TransportError {
    /// Whether this error is worth retrying: connection failures and 5xx
    /// responses are, 4xx responses (client errors) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Status { code, .. } => *code >= 500,
        }
    }
}

/// A minimal HTTP request/response pair, independent of any particular HTTP
/// client crate.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Self { method: "GET".to_string(), url: url.into(), body: None }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self { method: "POST".to_string(), url: url.into(), body: Some(body) }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Something that can turn a [`Request`] into a [`Response`], with no
/// resilience policies of its own. [`HttpTransport`] is the default,
/// `reqwest`-backed implementation; tests typically supply a closure or a
/// stub implementation instead.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// `reqwest`-backed [`Transport`].
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Connection(format!("invalid method: {e}")))?;

        let mut builder = self.client.request(method, &request.url);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| TransportError::Connection(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| TransportError::Connection(e.to_string()))?;

        if status >= 400 {
            return Err(TransportError::Status { code: status, body: String::from_utf8_lossy(&body).into_owned() });
        }

        Ok(Response { status, body: body.to_vec() })
    }
}

/// A [`Transport`] wrapped in a [`ResilienceStack`] (Retry → CircuitBreaker
/// → Timeout), so every call through it inherits the same backoff, breaker,
/// and deadline behavior as any other resilient operation in this crate.
#[derive(Clone)]
pub struct ResilientTransport<T> {
    inner: T,
    stack: ResilienceStack<TransportError>,
}

impl<T: Transport> ResilientTransport<T> {
    /// Wrap `inner` with a stack built from `timeout`/`max_attempts`/the
    /// default circuit breaker, retrying only on [`TransportError::is_retryable`].
    pub fn new(inner: T, timeout: Duration, max_attempts: usize) -> Result<Self, StackError> {
        let retry = crate::RetryPolicy::builder()
            .max_attempts(max_attempts)
            .map_err(|_| StackError::Timeout(crate::TimeoutError::ZeroDuration))?
            .should_retry(|e: &TransportError| e.is_retryable())
            .build();

        let stack = ResilienceStackBuilder::new()
            .timeout(timeout)
            .map_err(StackError::from)?
            .circuit_breaker(5, Duration::from_secs(30))
            .retry(retry)
            .build()
            .expect("stack with retry and timeout configured is always buildable");

        Ok(Self { inner, stack })
    }

    /// Wrap `inner` with an already-configured stack, for callers who need
    /// non-default circuit breaker settings or a custom retry predicate.
    pub fn with_stack(inner: T, stack: ResilienceStack<TransportError>) -> Self {
        Self { inner, stack }
    }

    pub async fn send(&self, request: Request) -> Result<Response, ResilienceError<TransportError>> {
        self.send_cancellable(request, &CancellationToken::new()).await
    }

    pub async fn send_cancellable(
        &self,
        request: Request,
        ctx: &CancellationToken,
    ) -> Result<Response, ResilienceError<TransportError>> {
        self.stack
            .execute_cancellable(ctx, || {
                let inner = &self.inner;
                let request = request.clone();
                async move { inner.send(request).await.map_err(ResilienceError::Inner) }
            })
            .await
    }
}
