// Transition handle - the per-color firing state machine

//! # Transitions
//!
//! A transition fires independently per color. The per-(transition, color)
//! state machine is:
//!
//! ```text
//! idle --(enabler arrives, all input arcs marked)--> firing --(outputs pushed)--> fired
//!   |
//!   +--(enabler arrives, inputs not all marked)--> idle (enabler recorded)
//! ```
//!
//! States never move backward. The idle->firing edge is taken inside the
//! store's atomic `consume_tokens` script, so of all the concurrent
//! notifications racing on a (transition, color) exactly one consumes the
//! input markings; the rest observe `AlreadyEnabled`, `NotReady` or
//! `AlreadyFired` and do nothing.

use std::sync::Arc;
use tracing::debug;

use crate::petri::actions::TransitionKind;
use crate::petri::color::ColorDescriptor;
use crate::petri::net::Net;
use crate::petri::token::Token;
use crate::protocol::Message;
use crate::services::Services;
use crate::store::{ConsumeOutcome, ConsumeTokensRequest, Store};
use crate::{FlowError, Result};

/// Where a (transition, color) pair is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionState {
    Idle,
    Firing,
    Fired,
}

/// A transition persisted under `<net_key>:T:<idx>`.
///
/// The hash behind the key holds the serialized [`TransitionKind`]; arcs
/// live in `<key>:arcs_in` / `<key>:arcs_out` sets of place indices, the
/// recorded enablers in the `<key>:enablers` hash, and the per-color state
/// and consumed-token records under `<key>:state:<color>` and
/// `<key>:active_tokens:<color>`.
#[derive(Clone)]
pub struct Transition {
    store: Arc<dyn Store>,
    key: String,
    index: u64,
}

impl Transition {
    pub(crate) fn new(store: Arc<dyn Store>, key: String, index: u64) -> Self {
        Self { store, key, index }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub async fn name(&self) -> Result<Option<String>> {
        self.store.hget(&self.key, "name").await
    }

    pub(crate) async fn set_name(&self, name: &str) -> Result<()> {
        self.store.hset(&self.key, "name", name).await
    }

    pub async fn kind(&self) -> Result<TransitionKind> {
        let raw = self
            .store
            .hget(&self.key, "kind")
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("transition {}", self.key)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) async fn set_kind(&self, kind: &TransitionKind) -> Result<()> {
        self.store
            .hset(&self.key, "kind", &serde_json::to_string(kind)?)
            .await
    }

    fn arcs_in_key(&self) -> String {
        format!("{}:arcs_in", self.key)
    }

    fn arcs_out_key(&self) -> String {
        format!("{}:arcs_out", self.key)
    }

    fn enablers_key(&self) -> String {
        format!("{}:enablers", self.key)
    }

    pub fn state_key(&self, color: u64) -> String {
        format!("{}:state:{}", self.key, color)
    }

    pub fn active_tokens_key(&self, color: u64) -> String {
        format!("{}:active_tokens:{}", self.key, color)
    }

    /// Places whose markings this transition consumes
    pub async fn arcs_in(&self) -> Result<Vec<u64>> {
        self.store.smembers(&self.arcs_in_key()).await
    }

    /// Places this transition feeds
    pub async fn arcs_out(&self) -> Result<Vec<u64>> {
        self.store.smembers(&self.arcs_out_key()).await
    }

    pub(crate) async fn add_arc_in(&self, place_idx: u64) -> Result<()> {
        self.store.sadd(&self.arcs_in_key(), place_idx).await?;
        Ok(())
    }

    pub(crate) async fn add_arc_out(&self, place_idx: u64) -> Result<()> {
        self.store.sadd(&self.arcs_out_key(), place_idx).await?;
        Ok(())
    }

    pub async fn state(&self, color: u64) -> Result<TransitionState> {
        match self.store.get(&self.state_key(color)).await?.as_deref() {
            None | Some("idle") => Ok(TransitionState::Idle),
            Some("firing") => Ok(TransitionState::Firing),
            Some("fired") => Ok(TransitionState::Fired),
            Some(other) => Err(FlowError::store(anyhow::anyhow!(
                "corrupt transition state: {}",
                other
            ))),
        }
    }

    /// Token indices consumed by the firing for this color
    pub async fn active_tokens(&self, color: u64) -> Result<Vec<u64>> {
        self.store.smembers(&self.active_tokens_key(color)).await
    }

    /// The atomic pre-firing step (store script). See [`ConsumeOutcome`]
    /// for what each result means to the caller.
    pub async fn consume_tokens(
        &self,
        enabler: u64,
        color_descriptor: &ColorDescriptor,
        color_marking_key: &str,
        group_marking_key: &str,
    ) -> Result<ConsumeOutcome> {
        let state_key = self.state_key(color_descriptor.color);
        let active_tokens_key = self.active_tokens_key(color_descriptor.color);
        let arcs_in_key = self.arcs_in_key();
        let enablers_key = self.enablers_key();

        let request = ConsumeTokensRequest {
            state_key: &state_key,
            active_tokens_key: &active_tokens_key,
            arcs_in_key: &arcs_in_key,
            color_marking_key,
            group_marking_key,
            enablers_key: &enablers_key,
            enabler,
            color_group_idx: color_descriptor.group.idx,
            color: color_descriptor.color,
        };

        let outcome = self.store.consume_tokens(request).await?;
        debug!(
            transition = self.index,
            color = color_descriptor.color,
            enabler,
            ?outcome,
            "consume_tokens"
        );
        Ok(outcome)
    }

    /// Run the action with the consumed tokens; returns the output tokens
    pub async fn fire(
        &self,
        net: &Net,
        color_descriptor: &ColorDescriptor,
        services: &Services,
    ) -> Result<Vec<Token>> {
        let active_tokens = self.active_tokens(color_descriptor.color).await?;
        let kind = self.kind().await?;
        let action = kind.action();
        action
            .execute(net, color_descriptor, &active_tokens, services)
            .await
    }

    /// Put every output token into every outgoing place. Re-running after a
    /// partial failure re-puts the same token indices, which the marking
    /// script treats as a no-op.
    pub async fn push_tokens(&self, net: &Net, tokens: &[Token]) -> Result<()> {
        for place_idx in self.arcs_out().await? {
            for token in tokens {
                net.put_token(place_idx, token).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn set_fired(&self, color: u64) -> Result<()> {
        self.store.set(&self.state_key(color), "fired").await
    }

    /// Publish a `NotifyPlace` for every (outgoing place, output color)
    pub async fn notify_places(
        &self,
        net_key: &str,
        colors: &[u64],
        services: &Services,
    ) -> Result<()> {
        for place_idx in self.arcs_out().await? {
            for color in colors {
                services
                    .publisher
                    .publish(
                        &services.routes.exchange,
                        &services.routes.notify_place,
                        &Message::NotifyPlace {
                            net_key: net_key.to_string(),
                            place_idx,
                            color: *color,
                        },
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
