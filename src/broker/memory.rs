// In-process message bus for tests and single-process runs

//! # Memory Broker
//!
//! Routes published messages through the same exchange/binding tables an
//! AMQP broker would use, but delivers them by draining an in-process queue.
//! There are no delivery tags and no confirms; every handled message is
//! gone, every failed one is logged and dropped (re-publishing is the
//! test's job). Duplicate-delivery behavior is exercised by publishing the
//! same message twice.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

use super::{Broker, MessageHandler, Publisher};
use crate::protocol::{codec, Message};
use crate::services::ServiceContext;
use crate::Result;

/// Does an AMQP topic pattern match a routing key?
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some((&"*", rest_pattern)), Some((_, rest_key))) => matches(rest_pattern, rest_key),
            (Some((&word, rest_pattern)), Some((&head, rest_key))) => {
                word == head && matches(rest_pattern, rest_key)
            }
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Debug, Clone)]
struct QueueBinding {
    queue: String,
    pattern: String,
}

/// In-memory implementation of [`Broker`] and [`Publisher`]
pub struct MemoryBroker {
    /// exchange -> bindings
    bindings: DashMap<String, Vec<QueueBinding>>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    /// One global FIFO of (queue, payload); a single delivery order keeps
    /// tests deterministic.
    pending: Mutex<VecDeque<(String, Vec<u8>)>>,
}

impl MemoryBroker {
    /// Build from an exchange -> queue -> routing-key-patterns table (the
    /// same shape the configuration uses for the AMQP broker)
    pub fn new(
        bindings: &std::collections::HashMap<String, std::collections::HashMap<String, Vec<String>>>,
    ) -> Self {
        let broker = Self {
            bindings: DashMap::new(),
            handlers: DashMap::new(),
            pending: Mutex::new(VecDeque::new()),
        };
        for (exchange, queues) in bindings {
            let mut entries = Vec::new();
            for (queue, patterns) in queues {
                for pattern in patterns {
                    entries.push(QueueBinding {
                        queue: queue.clone(),
                        pattern: pattern.clone(),
                    });
                }
            }
            broker.bindings.insert(exchange.clone(), entries);
        }
        broker
    }

    /// Messages currently queued and undelivered
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn pop_pending(&self) -> Option<(String, Vec<u8>)> {
        self.pending.lock().unwrap().pop_front()
    }

    /// Drain the queue until no messages remain. Handlers may publish while
    /// handling; those messages are drained too.
    pub async fn run_until_idle(self: &Arc<Self>, context: &ServiceContext) -> Result<()> {
        let services = context.services(self.clone() as Arc<dyn Publisher>);

        while let Some((queue, payload)) = self.pop_pending() {
            let handler = match self.handlers.get(&queue) {
                Some(handler) => handler.clone(),
                None => {
                    warn!(%queue, "no handler registered; message dropped");
                    continue;
                }
            };

            let message = match codec::decode(&payload) {
                Ok(message) => message,
                Err(e) => {
                    error!(%queue, error = %e, "invalid message rejected");
                    continue;
                }
            };

            debug!(%queue, class = message.class_name(), "delivering");
            if let Err(e) = handler.handle(&message, &services).await {
                error!(%queue, class = message.class_name(), error = %e, "handler failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, message: &Message) -> Result<()> {
        let payload = codec::encode(message)?;
        let mut routed = false;

        if let Some(bindings) = self.bindings.get(exchange) {
            for binding in bindings.iter() {
                if topic_matches(&binding.pattern, routing_key) {
                    self.pending
                        .lock()
                        .unwrap()
                        .push_back((binding.queue.clone(), payload.clone()));
                    routed = true;
                }
            }
        }

        if !routed {
            // The AMQP broker diverts these to the alternate exchange.
            warn!(exchange, routing_key, "no matching binding for publish");
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn register_handler(&self, queue: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(queue.to_string(), handler);
    }

    async fn listen(&self, _context: ServiceContext) -> Result<i32> {
        // The in-process bus has no consumers to park; draining happens
        // through run_until_idle, which needs the Arc'd receiver.
        Ok(0)
    }

    async fn disconnect(&self) {
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_matching_covers_amqp_wildcards() {
        assert!(topic_matches("petri.place.notify", "petri.place.notify"));
        assert!(!topic_matches("petri.place.notify", "petri.place.set"));
        assert!(topic_matches("petri.*.notify", "petri.place.notify"));
        assert!(!topic_matches("petri.*.notify", "petri.place.deep.notify"));
        assert!(topic_matches("petri.#", "petri.place.notify"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("petri.#.notify", "petri.notify"));
        assert!(!topic_matches("petri.#", "shell.command.submit"));
    }
}
