// AMQP 0-9-1 broker implementation (lapin)

//! # AMQP Broker
//!
//! Publishes and consumes over a durable topic exchange. Each configured
//! exchange is declared with an `alternate-exchange` argument so publishes
//! with no matching binding land in a `missing_routing_key` queue instead
//! of disappearing. Queues are durable and publishes use persistent
//! delivery mode; the bus, not the process, owns message durability.
//!
//! When the [`PublisherConfirmation`] acking strategy is active the channel
//! runs with publisher confirms enabled: every outbound publish is assigned
//! a publish tag, recorded against the receive tag being handled, and the
//! inbound ack is deferred until the strategy reports the receive tag safe.
//! A nacked publish is fatal - the broker disconnects and the process exits
//! non-zero so a supervisor can restart it.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::acking::{AckingStrategy, Immediate, PublisherConfirmation};
use super::{Broker, MessageHandler, Publisher};
use crate::protocol::{codec, Message};
use crate::services::ServiceContext;
use crate::{FlowError, Result};

/// Queue that collects publishes with no matching binding, via the
/// alternate exchange
pub const MISSING_ROUTING_KEY_QUEUE: &str = "missing_routing_key";

/// Which acking strategy the broker runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    Immediate,
    PublisherConfirmation,
}

impl Default for AckMode {
    fn default() -> Self {
        AckMode::PublisherConfirmation
    }
}

/// Connection-scoped state shared by consumers, publishers and confirm
/// waiters
struct AmqpCore {
    channel: Channel,
    connection: Connection,
    strategy: Mutex<Box<dyn AckingStrategy>>,
    confirms_enabled: bool,
    publish_seq: AtomicU64,
    exit_code: Arc<AtomicI32>,
    shutdown: Arc<Notify>,
}

impl AmqpCore {
    fn next_publish_tag(&self) -> u64 {
        self.publish_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn request_shutdown(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Drain the strategy's ackable set into basic.ack frames: a single
    /// (possibly multiple) ack for the safe prefix, then individual acks
    /// for tags stranded above an unackable gap.
    async fn ack_if_able(&self) {
        let (tags, multiple) = self.strategy.lock().unwrap().pop_ackable_receive_tags();
        let mut tags = tags.into_iter();

        let first = match tags.next() {
            Some(tag) => tag,
            None => return,
        };
        if let Err(e) = self
            .channel
            .basic_ack(first, BasicAckOptions { multiple })
            .await
        {
            error!(error = %e, "basic.ack failed");
            self.request_shutdown(1);
            return;
        }
        for tag in tags {
            if let Err(e) = self
                .channel
                .basic_ack(tag, BasicAckOptions { multiple: false })
                .await
            {
                error!(error = %e, "basic.ack failed");
                self.request_shutdown(1);
                return;
            }
        }
    }
}

/// Publisher bound to the inbound delivery being handled; every publish it
/// issues is recorded against that delivery's receive tag.
struct TaggedPublisher {
    core: Arc<AmqpCore>,
    receive_tag: u64,
}

#[async_trait]
impl Publisher for TaggedPublisher {
    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        let payload = codec::encode(message)?;
        debug!(
            exchange,
            routing_key,
            class = message.class_name(),
            "publishing"
        );

        // Record the publish before it goes out so the confirm can never
        // outrun the bookkeeping.
        let publish_tag = if self.core.confirms_enabled {
            let publish_tag = self.core.next_publish_tag();
            self.core
                .strategy
                .lock()
                .unwrap()
                .add_publish_tag(self.receive_tag, publish_tag);
            Some(publish_tag)
        } else {
            None
        };

        let confirm = self
            .core
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                // Persistent delivery: the message survives broker restarts
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(FlowError::bus)?;

        let publish_tag = match publish_tag {
            Some(publish_tag) => publish_tag,
            None => return Ok(()),
        };

        let core = self.core.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Nack(_)) => {
                    error!(publish_tag, "got failed publisher confirm; killing broker");
                    core.request_shutdown(1);
                }
                Ok(_) => {
                    core.strategy
                        .lock()
                        .unwrap()
                        .remove_publish_tag(publish_tag, false);
                    core.ack_if_able().await;
                }
                Err(e) => {
                    error!(publish_tag, error = %e, "publisher confirm lost; killing broker");
                    core.request_shutdown(1);
                }
            }
        });

        Ok(())
    }
}

/// AMQP implementation of [`Broker`]
pub struct AmqpBroker {
    url: String,
    prefetch_count: u16,
    ack_mode: AckMode,
    /// exchange -> queue -> routing key patterns
    bindings: HashMap<String, HashMap<String, Vec<String>>>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    core: OnceLock<Arc<AmqpCore>>,
    exit_code: Arc<AtomicI32>,
    shutdown: Arc<Notify>,
}

impl AmqpBroker {
    pub fn new(
        url: impl Into<String>,
        prefetch_count: u16,
        ack_mode: AckMode,
        bindings: HashMap<String, HashMap<String, Vec<String>>>,
    ) -> Self {
        Self {
            url: url.into(),
            prefetch_count,
            ack_mode,
            bindings,
            handlers: DashMap::new(),
            core: OnceLock::new(),
            exit_code: Arc::new(AtomicI32::new(0)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn make_strategy(&self) -> Box<dyn AckingStrategy> {
        match self.ack_mode {
            AckMode::Immediate => Box::new(Immediate::new()),
            AckMode::PublisherConfirmation => Box::new(PublisherConfirmation::new()),
        }
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<()> {
        for (exchange, queues) in &self.bindings {
            let alternate = format!("{}.alt", exchange);

            channel
                .exchange_declare(
                    &alternate,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(FlowError::bus)?;

            let mut arguments = FieldTable::default();
            arguments.insert(
                "alternate-exchange".into(),
                AMQPValue::LongString(alternate.as_str().into()),
            );
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    arguments,
                )
                .await
                .map_err(FlowError::bus)?;

            // Unroutable messages drain into a durable catch-all queue.
            channel
                .queue_declare(
                    MISSING_ROUTING_KEY_QUEUE,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(FlowError::bus)?;
            channel
                .queue_bind(
                    MISSING_ROUTING_KEY_QUEUE,
                    &alternate,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(FlowError::bus)?;

            for (queue, patterns) in queues {
                channel
                    .queue_declare(
                        queue,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await
                    .map_err(FlowError::bus)?;
                for pattern in patterns {
                    channel
                        .queue_bind(
                            queue,
                            exchange,
                            pattern,
                            QueueBindOptions::default(),
                            FieldTable::default(),
                        )
                        .await
                        .map_err(FlowError::bus)?;
                }
            }
        }
        Ok(())
    }
}

async fn handle_delivery(
    core: &Arc<AmqpCore>,
    handler: &Arc<dyn MessageHandler>,
    context: &ServiceContext,
    delivery: Delivery,
) {
    let receive_tag = delivery.delivery_tag;
    core.strategy.lock().unwrap().add_receive_tag(receive_tag);

    let message = match codec::decode(&delivery.data) {
        Ok(message) => message,
        Err(e) => {
            error!(receive_tag, error = %e, "invalid message; rejecting");
            core.strategy.lock().unwrap().discard_receive_tag(receive_tag);
            if let Err(e) = core
                .channel
                .basic_reject(receive_tag, BasicRejectOptions { requeue: false })
                .await
            {
                error!(error = %e, "basic.reject failed");
                core.request_shutdown(1);
            }
            return;
        }
    };

    let publisher = Arc::new(TaggedPublisher {
        core: core.clone(),
        receive_tag,
    });
    let services = context.services(publisher);

    match handler.handle(&message, &services).await {
        Ok(()) => {
            core.ack_if_able().await;
        }
        Err(e) if e.is_permanent() => {
            // Redelivery cannot help; drop the message for good.
            error!(receive_tag, class = message.class_name(), error = %e, "handler failed; rejecting");
            core.strategy.lock().unwrap().discard_receive_tag(receive_tag);
            if let Err(e) = core
                .channel
                .basic_reject(receive_tag, BasicRejectOptions { requeue: false })
                .await
            {
                error!(error = %e, "basic.reject failed");
                core.request_shutdown(1);
            }
        }
        Err(e) => {
            warn!(receive_tag, class = message.class_name(), error = %e, "transient handler failure; requeueing");
            core.strategy.lock().unwrap().discard_receive_tag(receive_tag);
            if let Err(e) = core
                .channel
                .basic_nack(
                    receive_tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await
            {
                error!(error = %e, "basic.nack failed");
                core.request_shutdown(1);
            }
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn register_handler(&self, queue: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(queue.to_string(), handler);
    }

    async fn listen(&self, context: ServiceContext) -> Result<i32> {
        info!(url = %self.url, "connecting to AMQP broker");
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(FlowError::bus)?;
        let channel = connection.create_channel().await.map_err(FlowError::bus)?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(FlowError::bus)?;

        self.declare_topology(&channel).await?;

        let confirms_enabled = self.ack_mode == AckMode::PublisherConfirmation;
        if confirms_enabled {
            debug!("enabling publisher confirms");
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(FlowError::bus)?;
        }

        let mut strategy = self.make_strategy();
        strategy.reset();
        let core = Arc::new(AmqpCore {
            channel,
            connection,
            strategy: Mutex::new(strategy),
            confirms_enabled,
            publish_seq: AtomicU64::new(0),
            exit_code: self.exit_code.clone(),
            shutdown: self.shutdown.clone(),
        });
        let _ = self.core.set(core.clone());

        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = self
            .handlers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (queue, handler) in handlers {
            let mut consumer = core
                .channel
                .basic_consume(
                    &queue,
                    &format!("petriflow.{}", queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(FlowError::bus)?;
            info!(%queue, "consuming");

            let core = core.clone();
            let context = context.clone();
            tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            handle_delivery(&core, &handler, &context, delivery).await;
                        }
                        Err(e) => {
                            error!(%queue, error = %e, "consumer failed; killing broker");
                            core.request_shutdown(1);
                            break;
                        }
                    }
                }
            });
        }

        tokio::select! {
            _ = self.shutdown.notified() => {
                info!("shutdown requested");
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "signal handler failed");
                }
                info!("interrupted; shutting down");
            }
        }

        if let Err(e) = core.connection.close(200, "shutting down").await {
            warn!(error = %e, "connection close failed");
        }

        Ok(self.exit_code.load(Ordering::SeqCst))
    }

    async fn disconnect(&self) {
        if let Some(core) = self.core.get() {
            core.request_shutdown(self.exit_code.load(Ordering::SeqCst));
        } else {
            self.shutdown.notify_waiters();
        }
    }
}
