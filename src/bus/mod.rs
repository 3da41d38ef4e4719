//! Asynchronous message bus abstraction.
//!
//! A topic-exchange publish/subscribe bus with correlation-id-keyed
//! request/reply on top, and at-least-once delivery: a handler that returns
//! `Err` gets its message redelivered exactly once before it is dropped.
//!
//! Two implementations ship here: [`AmqpMessageBus`](crate::bus::amqp::AmqpMessageBus),
//! backed by `lapin`/`deadpool-lapin`, and [`InProcessBus`], an in-memory
//! double with identical delivery semantics for tests and brokerless callers.
//!
//! Reply routing reuses the normal topic mechanism rather than a side channel:
//! a reply to a request with correlation id `cid` is just a message published
//! with routing key `reply.<cid>`, and each bus instance auto-subscribes to
//! `reply.#` at construction to complete the matching pending request.

mod amqp;
mod in_process;

pub use amqp::AmqpMessageBus;
pub use in_process::InProcessBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Prefix for the routing keys used to deliver request/reply responses.
pub(crate) const REPLY_ROUTING_PREFIX: &str = "reply.";

/// A type whose values travel over the bus as a named, routable message.
///
/// `TYPE_NAME` becomes the envelope's `message_type` and, unless a routing key
/// is given explicitly, the default routing key (lower-cased).
pub trait BusMessage: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static {
    /// Stable wire identifier for this message type, e.g. `"order.created"`.
    const TYPE_NAME: &'static str;
}

/// The envelope every message travels in, independent of payload shape.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub message_type: String,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Build a fresh envelope for `message_type` carrying `payload`, with no
    /// correlation id or reply-to address set.
    pub fn new(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            message_type: message_type.into(),
            correlation_id: None,
            reply_to: None,
            payload,
        }
    }

    /// Build an envelope from a typed [`BusMessage`], serialized to JSON.
    pub fn for_message<T: BusMessage>(payload: &T) -> Result<Self, BusError> {
        let value = serde_json::to_value(payload)
            .map_err(|e| BusError::Publish(format!("failed to serialize payload: {e}")))?;
        Ok(Self::new(T::TYPE_NAME, value))
    }

    /// Deserialize this envelope's payload as a typed [`BusMessage`].
    pub fn decode<T: BusMessage>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| BusError::Subscribe(format!("failed to deserialize payload: {e}")))
    }
}

/// A message as delivered to a subscribed handler.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub envelope: Envelope,
    pub routing_key: String,
    /// Set on the second (and final) delivery attempt after a handler error.
    pub redelivered: bool,
}

/// Errors the bus can surface to callers.
#[derive(Debug, Clone)]
pub enum BusError {
    Connection(String),
    Publish(String),
    Subscribe(String),
    Timeout(Duration),
    Cancelled,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Connection(msg) => write!(f, "bus connection error: {msg}"),
            BusError::Publish(msg) => write!(f, "bus publish error: {msg}"),
            BusError::Subscribe(msg) => write!(f, "bus subscribe error: {msg}"),
            BusError::Timeout(d) => write!(f, "request timed out after {d:?}"),
            BusError::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for BusError {}

/// A handler bound to a subscription.
///
/// Returning `Err` causes the message to be redelivered once with
/// `redelivered: true`; a second failure drops it without requeue.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: ReceivedMessage) -> Result<(), BusError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), BusError>> + Send + 'static,
{
    async fn handle(&self, message: ReceivedMessage) -> Result<(), BusError> {
        (self)(message).await
    }
}

/// A live subscription. Dropping it stops delivery to the bound handler.
pub struct Subscription {
    _cancel: tokio_util::sync::DropGuard,
}

impl Subscription {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { _cancel: token.drop_guard() }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// A bus connection capable of publishing, subscribing, and performing
/// correlated request/reply.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish `envelope`. `routing_key` defaults to the lower-cased message
    /// type when `None`.
    async fn publish(&self, envelope: Envelope, routing_key: Option<&str>) -> Result<(), BusError>;

    /// Subscribe `handler` to messages whose routing key matches `pattern`
    /// (an AMQP-style topic pattern: `*` matches one word, `#` matches zero
    /// or more). `pattern` defaults to the lower-cased `message_type` when
    /// `None`.
    async fn subscribe(
        &self,
        message_type: &str,
        pattern: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError>;

    /// Send `envelope` and await a correlated reply, with no external
    /// cancellation context.
    async fn request(
        &self,
        envelope: Envelope,
        routing_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Envelope, BusError> {
        self.request_cancellable(envelope, routing_key, timeout, &CancellationToken::new()).await
    }

    /// Send `envelope` and await a correlated reply, racing `timeout` against
    /// `ctx`'s cancellation.
    async fn request_cancellable(
        &self,
        envelope: Envelope,
        routing_key: Option<&str>,
        timeout: Duration,
        ctx: &CancellationToken,
    ) -> Result<Envelope, BusError>;
}

/// The default routing key for a message type: its lower-cased form.
pub(crate) fn default_routing_key(message_type: &str) -> String {
    message_type.to_lowercase()
}

/// The routing key a reply to `correlation_id` is published under.
pub(crate) fn reply_routing_key(correlation_id: Uuid) -> String {
    format!("{REPLY_ROUTING_PREFIX}{correlation_id}")
}

/// AMQP-style topic pattern match: `*` matches exactly one dot-separated
/// word, `#` matches zero or more words.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern_words: Vec<&str> = pattern.split('.').collect();
    let key_words: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern_words, &key_words)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            if pattern.len() == 1 {
                return true;
            }
            (0..=key.len()).any(|i| matches_words(&pattern[1..], &key[i..]))
        }
        Some(&"*") => !key.is_empty() && matches_words(&pattern[1..], &key[1..]),
        Some(word) => key.first() == Some(word) && matches_words(&pattern[1..], &key[1..]),
    }
}
