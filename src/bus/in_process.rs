//! In-memory [`MessageBus`] implementation for tests and brokerless callers.
//!
//! Dispatch is immediate: `publish` fans out to every matching subscription
//! on a spawned task per handler, so publishers never block on handler work.

use super::{
    default_routing_key, reply_routing_key, topic_matches, BusError, Envelope, MessageBus,
    MessageHandler, ReceivedMessage, Subscription,
};
use crate::telemetry::{Metrics, NoopMetrics};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct SubscriptionEntry {
    pattern: String,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
}

/// An in-memory bus. Subscriptions and pending requests live for as long as
/// the bus handle (or a clone of it) is alive.
#[derive(Clone)]
pub struct InProcessBus {
    inner: Arc<Inner>,
}

struct Inner {
    subscriptions: RwLock<Vec<SubscriptionEntry>>,
    pending: Mutex<std::collections::HashMap<Uuid, oneshot::Sender<Envelope>>>,
    metrics: Arc<dyn Metrics>,
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(NoopMetrics))
    }

    pub fn with_metrics(metrics: Arc<dyn Metrics>) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: RwLock::new(Vec::new()),
                pending: Mutex::new(std::collections::HashMap::new()),
                metrics,
            }),
        }
    }

    /// Number of currently live subscriptions. Useful in tests.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().expect("lock poisoned").len()
    }

    async fn dispatch(&self, key: &str, envelope: &Envelope) {
        if let Some(correlation_id) = envelope.correlation_id {
            if key.starts_with(super::REPLY_ROUTING_PREFIX) {
                if let Some(tx) = self.inner.pending.lock().expect("lock poisoned").remove(&correlation_id) {
                    let _ = tx.send(envelope.clone());
                }
                return;
            }
        }

        let matching: Vec<Arc<dyn MessageHandler>> = {
            let subs = self.inner.subscriptions.read().expect("lock poisoned");
            subs.iter()
                .filter(|s| !s.cancel.is_cancelled() && topic_matches(&s.pattern, key))
                .map(|s| s.handler.clone())
                .collect()
        };

        for handler in matching {
            let envelope = envelope.clone();
            let key = key.to_string();
            let metrics = self.inner.metrics.clone();
            tokio::spawn(async move {
                deliver_with_requeue(handler, envelope, key, metrics).await;
            });
        }
    }
}

async fn deliver_with_requeue(
    handler: Arc<dyn MessageHandler>,
    envelope: Envelope,
    routing_key: String,
    metrics: Arc<dyn Metrics>,
) {
    let message_type = envelope.message_type.clone();
    let first = ReceivedMessage { envelope: envelope.clone(), routing_key: routing_key.clone(), redelivered: false };
    match handler.handle(first).await {
        Ok(()) => metrics.record_message_operation(&message_type, "consume", "ok"),
        Err(_) => {
            let second = ReceivedMessage { envelope, routing_key, redelivered: true };
            match handler.handle(second).await {
                Ok(()) => metrics.record_message_operation(&message_type, "consume", "ok"),
                Err(_) => metrics.record_message_operation(&message_type, "consume", "rejected"),
            }
        }
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, envelope: Envelope, routing_key: Option<&str>) -> Result<(), BusError> {
        let key = routing_key
            .map(str::to_string)
            .unwrap_or_else(|| default_routing_key(&envelope.message_type));
        self.inner.metrics.record_message_operation(&envelope.message_type, "publish", "ok");
        self.dispatch(&key, &envelope).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        _message_type: &str,
        pattern: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        let pattern = pattern.map(str::to_string).unwrap_or_else(|| default_routing_key(_message_type));
        let cancel = CancellationToken::new();
        self.inner.subscriptions.write().expect("lock poisoned").push(SubscriptionEntry {
            pattern,
            handler,
            cancel: cancel.clone(),
        });
        Ok(Subscription::new(cancel))
    }

    async fn request_cancellable(
        &self,
        mut envelope: Envelope,
        routing_key: Option<&str>,
        timeout: Duration,
        ctx: &CancellationToken,
    ) -> Result<Envelope, BusError> {
        if ctx.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let correlation_id = Uuid::new_v4();
        envelope.correlation_id = Some(correlation_id);
        envelope.reply_to = Some(reply_routing_key(correlation_id));

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().expect("lock poisoned").insert(correlation_id, tx);

        if let Err(e) = self.publish(envelope, routing_key).await {
            self.inner.pending.lock().expect("lock poisoned").remove(&correlation_id);
            return Err(e);
        }

        let result = tokio::select! {
            r = rx => r,
            _ = ctx.cancelled() => {
                self.inner.pending.lock().expect("lock poisoned").remove(&correlation_id);
                return Err(BusError::Cancelled);
            }
            _ = tokio::time::sleep(timeout) => {
                self.inner.pending.lock().expect("lock poisoned").remove(&correlation_id);
                return Err(BusError::Timeout(timeout));
            }
        };

        result.map_err(|_| BusError::Connection("reply sender dropped".to_string()))
    }
}
