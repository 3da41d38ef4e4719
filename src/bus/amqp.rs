//! AMQP (RabbitMQ) [`MessageBus`] backed by `lapin` and `deadpool-lapin`.
//!
//! Messages travel over a single durable topic exchange. Each subscriber gets
//! its own durable queue named `<service>.<message_type>`, bound to the
//! exchange with the caller's routing pattern. Every bus instance also
//! declares an exclusive, auto-delete queue bound to `reply.#` to receive
//! correlated replies (see the module docs on [`super`]).
//!
//! Reconnection uses this crate's own [`Backoff`]/[`Jitter`] rather than an
//! external backoff crate, so the bus's retry behavior is tunable with the
//! same primitives callers already use for their own operations.

use super::{
    default_routing_key, reply_routing_key, BusError, Envelope, MessageBus, MessageHandler,
    ReceivedMessage, Subscription, REPLY_ROUTING_PREFIX,
};
use crate::telemetry::{Metrics, NoopMetrics};
use crate::{Backoff, Jitter};
use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Heartbeat interval negotiated with the broker.
const HEARTBEAT_SECS: u16 = 60;

/// Settings an [`AmqpMessageBus`] connects with.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    pub url: String,
    pub exchange: String,
    pub service_name: String,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>, exchange: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self { url: url.into(), exchange: exchange.into(), service_name: service_name.into() }
    }
}

struct PendingRequests {
    map: Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>,
}

impl PendingRequests {
    fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    fn insert(&self, id: Uuid, tx: oneshot::Sender<Envelope>) {
        self.map.lock().expect("lock poisoned").insert(id, tx);
    }

    fn remove(&self, id: &Uuid) -> Option<oneshot::Sender<Envelope>> {
        self.map.lock().expect("lock poisoned").remove(id)
    }

    fn complete(&self, id: Uuid, envelope: Envelope) {
        if let Some(tx) = self.remove(&id) {
            let _ = tx.send(envelope);
        }
    }
}

struct HandlerEntry {
    message_type: String,
    pattern: String,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
}

/// An AMQP-backed message bus.
///
/// Cloning shares the underlying pool, pending-request map, and subscriber
/// registry, so a single `AmqpMessageBus` can be cloned freely across tasks.
#[derive(Clone)]
pub struct AmqpMessageBus {
    pool: Pool,
    config: AmqpConfig,
    pending: Arc<PendingRequests>,
    handlers: Arc<RwLock<Vec<HandlerEntry>>>,
    metrics: Arc<dyn Metrics>,
}

impl AmqpMessageBus {
    /// Connect, declare the shared topic exchange, and start the reply
    /// listener. Returns once the exchange is confirmed declared.
    pub async fn connect(config: AmqpConfig) -> Result<Self, BusError> {
        Self::connect_with_metrics(config, Arc::new(NoopMetrics)).await
    }

    pub async fn connect_with_metrics(
        config: AmqpConfig,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self, BusError> {
        let manager = Manager::new(
            config.url.clone(),
            ConnectionProperties::default().with_connection_name(config.service_name.clone().into()),
        );
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| BusError::Connection(format!("failed to build pool: {e}")))?;

        let bus = Self {
            pool,
            config,
            pending: Arc::new(PendingRequests::new()),
            handlers: Arc::new(RwLock::new(Vec::new())),
            metrics,
        };

        bus.declare_exchange().await?;
        bus.start_reply_listener();
        Ok(bus)
    }

    async fn channel(&self) -> Result<Channel, BusError> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e: PoolError| BusError::Connection(format!("pool checkout failed: {e}")))?;
        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("channel creation failed: {e}")))
    }

    async fn declare_exchange(&self) -> Result<(), BusError> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("exchange declare failed: {e}")))?;
        info!(exchange = %self.config.exchange, "connected to AMQP broker");
        Ok(())
    }

    /// Subscribe this bus's reply queue to `reply.#` and dispatch arriving
    /// replies to the matching pending request, reconnecting with backoff on
    /// consumer failure.
    fn start_reply_listener(&self) {
        let bus = self.clone();
        let queue_name = format!("{}.replies.{}", self.config.service_name, Uuid::new_v4());
        tokio::spawn(async move {
            bus.consume_with_reconnect(queue_name, format!("{REPLY_ROUTING_PREFIX}#"), None, true)
                .await;
        });
    }

    /// Declare a durable queue bound to `pattern`, consume from it, and
    /// dispatch each delivery to either the pending-request map (for
    /// `reply.*` routing keys) or `handler` (for ordinary subscriptions).
    /// Reconnects with exponential backoff plus jitter whenever the consumer
    /// stream or its setup fails.
    async fn consume_with_reconnect(
        &self,
        queue_name: String,
        pattern: String,
        handler: Option<(Arc<dyn MessageHandler>, CancellationToken)>,
        reply_queue: bool,
    ) {
        let backoff = Backoff::exponential(Duration::from_millis(100)).with_max(Duration::from_secs(30));
        let jitter = Jitter::full();
        let mut attempt: usize = 0;

        loop {
            if let Some((_, cancel)) = &handler {
                if cancel.is_cancelled() {
                    return;
                }
            }

            match self.setup_consumer(&queue_name, &pattern, reply_queue).await {
                Ok(mut consumer) => {
                    attempt = 0;
                    info!(queue = %queue_name, pattern = %pattern, "consumer connected");
                    loop {
                        let delivery = if let Some((_, cancel)) = &handler {
                            tokio::select! {
                                d = consumer.next() => d,
                                _ = cancel.cancelled() => { return; }
                            }
                        } else {
                            consumer.next().await
                        };

                        match delivery {
                            Some(Ok(delivery)) => {
                                self.process_delivery(delivery, handler.as_ref().map(|(h, _)| h.clone()))
                                    .await;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, queue = %queue_name, "delivery error, reconnecting");
                                break;
                            }
                            None => {
                                warn!(queue = %queue_name, "consumer stream ended, reconnecting");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    attempt += 1;
                    let delay = jitter.apply(backoff.delay(attempt));
                    error!(error = %e, queue = %queue_name, delay_ms = %delay.as_millis(), "consumer setup failed");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn setup_consumer(
        &self,
        queue_name: &str,
        pattern: &str,
        reply_queue: bool,
    ) -> Result<lapin::Consumer, BusError> {
        let channel = self.channel().await?;

        let declare_options = if reply_queue {
            // One exclusive, auto-deleting reply queue per process (§4.5):
            // it dies with this connection rather than surviving as a
            // durable queue no one will ever rebind.
            QueueDeclareOptions { durable: false, exclusive: true, auto_delete: true, ..Default::default() }
        } else {
            QueueDeclareOptions { durable: true, ..Default::default() }
        };

        channel
            .queue_declare(queue_name, declare_options, FieldTable::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("queue declare failed: {e}")))?;

        channel
            .queue_bind(
                queue_name,
                &self.config.exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("queue bind failed: {e}")))?;

        channel
            .basic_consume(
                queue_name,
                &format!("{}-consumer", self.config.service_name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("consume failed: {e}")))
    }

    async fn process_delivery(&self, delivery: lapin::message::Delivery, handler: Option<Arc<dyn MessageHandler>>) {
        let routing_key = delivery.routing_key.to_string();
        let redelivered = delivery.redelivered;

        let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, routing_key = %routing_key, "failed to decode envelope, rejecting without requeue");
                let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
                return;
            }
        };

        if routing_key.starts_with(REPLY_ROUTING_PREFIX) {
            if let Some(correlation_id) = envelope.correlation_id {
                self.pending.complete(correlation_id, envelope);
            }
            let _ = delivery.ack(BasicAckOptions::default()).await;
            return;
        }

        let Some(handler) = handler else {
            let _ = delivery.ack(BasicAckOptions::default()).await;
            return;
        };

        let message_type = envelope.message_type.clone();
        let message = ReceivedMessage { envelope, routing_key, redelivered };

        match handler.handle(message).await {
            Ok(()) => {
                self.metrics.record_message_operation(&message_type, "consume", "ok");
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            Err(e) if !redelivered => {
                debug!(error = %e, message_type = %message_type, "handler failed, requeueing once");
                let _ = delivery.nack(BasicNackOptions { requeue: true, ..Default::default() }).await;
            }
            Err(e) => {
                error!(error = %e, message_type = %message_type, "handler failed on redelivery, dropping");
                self.metrics.record_message_operation(&message_type, "consume", "rejected");
                let _ = delivery.nack(BasicNackOptions { requeue: false, ..Default::default() }).await;
            }
        }
    }
}

#[async_trait]
impl MessageBus for AmqpMessageBus {
    async fn publish(&self, envelope: Envelope, routing_key: Option<&str>) -> Result<(), BusError> {
        let key = routing_key
            .map(str::to_string)
            .unwrap_or_else(|| default_routing_key(&envelope.message_type));

        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| BusError::Publish(format!("failed to serialize envelope: {e}")))?;

        let channel = self.channel().await?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let confirm = channel
            .basic_publish(&self.config.exchange, &key, BasicPublishOptions::default(), &payload, properties)
            .await
            .map_err(|e| BusError::Publish(format!("publish failed: {e}")))?;

        confirm.await.map_err(|e| BusError::Publish(format!("publish not confirmed: {e}")))?;

        self.metrics.record_message_operation(&envelope.message_type, "publish", "ok");
        Ok(())
    }

    async fn subscribe(
        &self,
        message_type: &str,
        pattern: Option<&str>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, BusError> {
        let pattern = pattern.map(str::to_string).unwrap_or_else(|| default_routing_key(message_type));
        let queue_name = format!("{}.{}", self.config.service_name, message_type);
        let cancel = CancellationToken::new();

        self.handlers.write().expect("lock poisoned").push(HandlerEntry {
            message_type: message_type.to_string(),
            pattern: pattern.clone(),
            handler: handler.clone(),
            cancel: cancel.clone(),
        });

        let bus = self.clone();
        let consume_pattern = pattern.clone();
        let consume_cancel = cancel.clone();
        tokio::spawn(async move {
            bus.consume_with_reconnect(queue_name, consume_pattern, Some((handler, consume_cancel)), false)
                .await;
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
        self.pending.insert(correlation_id, tx);

        if let Err(e) = self.publish(envelope, routing_key).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        tokio::select! {
            r = rx => r.map_err(|_| BusError::Connection("reply sender dropped".to_string())),
            _ = ctx.cancelled() => {
                self.pending.remove(&correlation_id);
                Err(BusError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                self.pending.remove(&correlation_id);
                Err(BusError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_exchange_and_service_name() {
        let config = AmqpConfig::new("amqp://localhost:5672", "microservices.events", "orders");
        assert_eq!(config.exchange, "microservices.events");
        assert_eq!(config.service_name, "orders");
    }

    #[test]
    fn pending_requests_complete_and_forget_unknown_ids() {
        let pending = PendingRequests::new();
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);

        // Completing an unrelated id is a no-op, not a panic.
        pending.complete(Uuid::new_v4(), Envelope::new("noop", serde_json::json!({})));
        assert!(rx.try_recv().is_err());

        pending.complete(id, Envelope::new("pong", serde_json::json!({"ok": true})));
        let envelope = rx.try_recv().expect("reply should have arrived");
        assert_eq!(envelope.payload["ok"], true);
    }

    #[test]
    fn reply_queue_name_is_namespaced_per_instance() {
        let a = format!("svc.replies.{}", Uuid::new_v4());
        let b = format!("svc.replies.{}", Uuid::new_v4());
        assert_ne!(a, b);
    }
}
