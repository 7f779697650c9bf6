// Broker abstraction - publish/consume with pluggable acking

//! # Broker Layer
//!
//! Messages arrive on queues, get decoded, and are dispatched to the
//! handler registered for the queue; handlers publish follow-up messages
//! back through the broker. The broker translates handler outcome into
//! ack/reject: workflow-level bugs are rejected without requeue, transient
//! failures lean on the bus's redelivery.
//!
//! Two implementations share the traits here:
//!
//! - [`amqp::AmqpBroker`]: AMQP 0-9-1 over a durable topic exchange, with
//!   an [`acking::AckingStrategy`] deciding when inbound deliveries may be
//!   acked upstream
//! - [`memory::MemoryBroker`]: an in-process bus with the same routing
//!   semantics, used by tests and single-process runs

pub mod acking;
pub mod amqp;
pub mod memory;
pub mod mgmt;

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::Message;
use crate::services::{ServiceContext, Services};
use crate::Result;

/// Something that can put a domain message on the bus.
///
/// The broker hands each handler invocation a publisher bound to the
/// inbound delivery being handled, so outbound publishes can be attributed
/// to the message that caused them.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()>;
}

/// A message handler attached to a queue.
///
/// Handlers must be idempotent under duplicate delivery and must not hold
/// locks across their await points; the broker may run many invocations
/// concurrently.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message, services: &Services) -> Result<()>;
}

/// The broker surface the binaries wire up
#[async_trait]
pub trait Broker: Send + Sync {
    /// Attach a handler to a queue. Must be called before `listen`.
    fn register_handler(&self, queue: &str, handler: Arc<dyn MessageHandler>);

    /// Consume until shutdown; returns the process exit code (0 on clean
    /// shutdown, 1 on fatal publisher nack or unrecoverable channel error).
    async fn listen(&self, context: ServiceContext) -> Result<i32>;

    /// Tear the connection down; in-flight handlers finish naturally and
    /// their messages are redelivered by the bus on reconnect.
    async fn disconnect(&self);
}
