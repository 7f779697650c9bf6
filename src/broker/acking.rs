// Acking strategies - when may an inbound message be acked upstream?

//! # Acking Strategies
//!
//! The broker does not ack an inbound delivery the moment its handler
//! returns; the strategy decides. [`Immediate`] acks as soon as a handler
//! succeeds. [`PublisherConfirmation`] guarantees that an inbound message is
//! acked only after every outbound message published while handling it has
//! been positively confirmed by the broker - if the process dies first, the
//! bus redelivers the inbound message and idempotence absorbs the repeat.
//!
//! The bookkeeping runs on AMQP's per-channel monotonic delivery tags:
//! receive tags for inbound messages, publish tags for outbound ones. A
//! multiple-ack covers every tag up to and including the given one, which
//! is what [`AckingStrategy::pop_ackable_receive_tags`] exploits to
//! compress the contiguous safe prefix into a single ack.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Decides when inbound receive tags may be acked.
///
/// The broker calls `add_receive_tag` on delivery, `add_publish_tag` for
/// every publish a handler issues, `remove_publish_tag` as publisher
/// confirms arrive, and drains `pop_ackable_receive_tags` whenever any of
/// those events may have made progress.
pub trait AckingStrategy: Send {
    /// Clear all state (connection reset)
    fn reset(&mut self);

    /// An inbound delivery arrived
    fn add_receive_tag(&mut self, receive_tag: u64);

    /// Handling `receive_tag` caused the outbound `publish_tag`
    fn add_publish_tag(&mut self, receive_tag: u64, publish_tag: u64);

    /// The broker confirmed `publish_tag`; with `multiple`, every
    /// outstanding publish tag up to and including it
    fn remove_publish_tag(&mut self, publish_tag: u64, multiple: bool);

    /// Drop a receive tag whose handler failed; the delivery is rejected
    /// instead of acked, so it must not linger in the bookkeeping
    fn discard_receive_tag(&mut self, receive_tag: u64);

    /// Produce the ack batch: `(tags, multiple)` where `multiple` says the
    /// first (smallest) tag should be a multiple-ack. Tags returned here
    /// leave the strategy; an immediate second call returns `([], false)`.
    fn pop_ackable_receive_tags(&mut self) -> (Vec<u64>, bool);
}

/// Ack as soon as the handler succeeds.
///
/// Only the largest seen receive tag is remembered; popping it with
/// `multiple = true` acks everything at or below it in one frame.
#[derive(Debug, Default)]
pub struct Immediate {
    largest_receive_tag: u64,
}

impl Immediate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AckingStrategy for Immediate {
    fn reset(&mut self) {
        self.largest_receive_tag = 0;
    }

    fn add_receive_tag(&mut self, receive_tag: u64) {
        self.largest_receive_tag = receive_tag;
    }

    fn add_publish_tag(&mut self, _receive_tag: u64, _publish_tag: u64) {}

    fn remove_publish_tag(&mut self, _publish_tag: u64, _multiple: bool) {}

    fn discard_receive_tag(&mut self, _receive_tag: u64) {}

    fn pop_ackable_receive_tags(&mut self) -> (Vec<u64>, bool) {
        if self.largest_receive_tag == 0 {
            return (Vec::new(), false);
        }
        let tag = std::mem::take(&mut self.largest_receive_tag);
        (vec![tag], true)
    }
}

/// Delay acks until every caused publish is confirmed.
///
/// A receive tag lives in exactly one of two sorted sets: `ackable` (no
/// outstanding publishes) or `non_ackable` (waiting on confirms). The maps
/// tie outstanding publish tags back to the receive tags that caused them.
#[derive(Debug, Default)]
pub struct PublisherConfirmation {
    ackable_receive_tags: BTreeSet<u64>,
    non_ackable_receive_tags: BTreeSet<u64>,
    unconfirmed_publish_tags: BTreeSet<u64>,
    publish_to_receive: HashMap<u64, u64>,
    receive_to_publishes: HashMap<u64, BTreeSet<u64>>,
}

impl PublisherConfirmation {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_single_publish_tag(&mut self, publish_tag: u64) {
        let receive_tag = match self.publish_to_receive.remove(&publish_tag) {
            Some(receive_tag) => receive_tag,
            None => return,
        };

        let publishes = match self.receive_to_publishes.get_mut(&receive_tag) {
            Some(publishes) => publishes,
            None => return,
        };
        publishes.remove(&publish_tag);

        if publishes.is_empty() {
            self.receive_to_publishes.remove(&receive_tag);
            self.non_ackable_receive_tags.remove(&receive_tag);
            self.ackable_receive_tags.insert(receive_tag);
            debug!(receive_tag, "receive tag ready to ack");
        } else {
            debug!(
                receive_tag,
                outstanding = self.receive_to_publishes[&receive_tag].len(),
                "still waiting on publisher confirms"
            );
        }
    }
}

impl AckingStrategy for PublisherConfirmation {
    fn reset(&mut self) {
        debug!("resetting publisher confirmation state");
        *self = Self::default();
    }

    fn add_receive_tag(&mut self, receive_tag: u64) {
        self.ackable_receive_tags.insert(receive_tag);
    }

    fn add_publish_tag(&mut self, receive_tag: u64, publish_tag: u64) {
        if self.ackable_receive_tags.remove(&receive_tag) {
            self.non_ackable_receive_tags.insert(receive_tag);
        }

        self.receive_to_publishes
            .entry(receive_tag)
            .or_default()
            .insert(publish_tag);
        self.publish_to_receive.insert(publish_tag, receive_tag);
        self.unconfirmed_publish_tags.insert(publish_tag);
    }

    fn remove_publish_tag(&mut self, publish_tag: u64, multiple: bool) {
        if multiple {
            let confirmed: Vec<u64> = self
                .unconfirmed_publish_tags
                .range(..=publish_tag)
                .copied()
                .collect();
            debug!(publish_tag, ?confirmed, "multiple publisher confirm");
            for tag in confirmed {
                self.unconfirmed_publish_tags.remove(&tag);
                self.remove_single_publish_tag(tag);
            }
        } else {
            debug!(publish_tag, "single publisher confirm");
            self.unconfirmed_publish_tags.remove(&publish_tag);
            self.remove_single_publish_tag(publish_tag);
        }
    }

    fn discard_receive_tag(&mut self, receive_tag: u64) {
        self.ackable_receive_tags.remove(&receive_tag);
        self.non_ackable_receive_tags.remove(&receive_tag);
        if let Some(publishes) = self.receive_to_publishes.remove(&receive_tag) {
            for publish_tag in publishes {
                self.publish_to_receive.remove(&publish_tag);
                self.unconfirmed_publish_tags.remove(&publish_tag);
            }
        }
    }

    fn pop_ackable_receive_tags(&mut self) -> (Vec<u64>, bool) {
        if self.ackable_receive_tags.is_empty() {
            return (Vec::new(), false);
        }

        let largest_ackable = *self.ackable_receive_tags.iter().next_back().unwrap();
        let smallest_unackable = self.non_ackable_receive_tags.iter().next().copied();

        let (ready_tags, multiple) = match smallest_unackable {
            // No unackable barrier below our largest tag: one multi-ack
            // through the largest covers the whole set.
            None => (vec![largest_ackable], self.ackable_receive_tags.len() > 1),
            Some(barrier) if barrier > largest_ackable => {
                (vec![largest_ackable], self.ackable_receive_tags.len() > 1)
            }
            // The barrier splits the set: multi-ack up through the largest
            // tag below it, then ack everything above it individually.
            Some(barrier) => {
                let below: Vec<u64> = self
                    .ackable_receive_tags
                    .range(..barrier)
                    .copied()
                    .collect();
                let mut ready_tags = Vec::new();
                let mut multiple = false;
                if let Some(&prefix_end) = below.last() {
                    ready_tags.push(prefix_end);
                    if below.len() > 1 {
                        multiple = true;
                    }
                }
                ready_tags.extend(
                    self.ackable_receive_tags
                        .range(barrier..)
                        .copied(),
                );
                (ready_tags, multiple)
            }
        };

        self.ackable_receive_tags.clear();
        (ready_tags, multiple)
    }
}
