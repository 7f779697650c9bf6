// Transition actions - what a transition does when it fires

//! # Transition Actions
//!
//! When `consume_tokens` reports `Ready`, the transition's action runs with
//! the consumed tokens and produces the output tokens that continue the
//! flow. Actions are polymorphic over a closed capability set:
//!
//! - [`TransitionKind::Merge`]: fold the consumed tokens into one output
//!   token of the firing color (the default when a transition has no
//!   explicit behavior)
//! - [`TransitionKind::Bridge`]: the synthetic transition created when a
//!   subnet is spliced into a host net; merge behavior, distinct kind so
//!   composed nets stay inspectable
//! - [`TransitionKind::ShellDispatch`]: merge, then publish a
//!   [`Message::Submit`] message routing a shell command to an executor
//!   service
//!
//! The kind is serialized into the transition's hash at construction time,
//! so any orchestrator worker can revive the right behavior from the store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::petri::color::ColorDescriptor;
use crate::petri::net::Net;
use crate::petri::token::Token;
use crate::protocol::{ExecutorOptions, Message};
use crate::services::Services;
use crate::Result;

/// Arguments of a shell-dispatch transition.
///
/// `response_places` maps the logical response names the dispatch service
/// understands onto place indices of this net; the indices are rebased when
/// the net is spliced into a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellDispatchArgs {
    pub command_line: Vec<String>,
    pub response_places: BTreeMap<String, u64>,
    #[serde(default)]
    pub executor_options: ExecutorOptions,
}

/// The serializable behavior attached to a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionKind {
    Merge,
    Bridge,
    ShellDispatch(ShellDispatchArgs),
}

impl TransitionKind {
    /// Shift every place reference by `offset`; used when splicing a subnet
    /// into a host net rebases the subnet's indices.
    pub fn rebase_places(&mut self, offset: u64) {
        if let TransitionKind::ShellDispatch(args) = self {
            for place_idx in args.response_places.values_mut() {
                *place_idx += offset;
            }
        }
    }

    /// The behavior behind this kind
    pub fn action(&self) -> Box<dyn TransitionAction> {
        match self {
            TransitionKind::Merge | TransitionKind::Bridge => Box::new(MergeAction),
            TransitionKind::ShellDispatch(args) => Box::new(ShellDispatchAction {
                args: args.clone(),
            }),
        }
    }
}

/// A transition's firing behavior.
///
/// Implementations receive the indices of the consumed (active) tokens and
/// return the output tokens to push through the outgoing arcs. They may
/// publish follow-up messages through the services but must not mutate
/// markings themselves; pushing outputs is the engine's job so it stays
/// idempotent under redelivery.
#[async_trait]
pub trait TransitionAction: Send + Sync {
    async fn execute(
        &self,
        net: &Net,
        color_descriptor: &ColorDescriptor,
        active_tokens: &[u64],
        services: &Services,
    ) -> Result<Vec<Token>>;
}

/// Fold the consumed tokens into a single output token.
///
/// Token data objects are merged key-by-key in token-index order; later
/// tokens win on conflicts. Non-object data is skipped.
pub struct MergeAction;

#[async_trait]
impl TransitionAction for MergeAction {
    async fn execute(
        &self,
        net: &Net,
        color_descriptor: &ColorDescriptor,
        active_tokens: &[u64],
        services: &Services,
    ) -> Result<Vec<Token>> {
        let _ = services;
        let mut merged = serde_json::Map::new();
        for token_idx in active_tokens {
            if let Some(serde_json::Value::Object(map)) = net.token(*token_idx).data().await? {
                merged.extend(map);
            }
        }

        let data = if merged.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(merged))
        };

        let token = net
            .create_token(
                color_descriptor.color,
                color_descriptor.group.idx,
                data,
            )
            .await?;
        Ok(vec![token])
    }
}

/// Merge, then route the configured command line to the dispatch service.
///
/// The submit message carries the firing color so the dispatch service can
/// answer with tokens of the same color, and the workflow-scoped constants
/// (`user_id`, `group_id`, `environment`, `working_directory`) folded into
/// the executor options.
pub struct ShellDispatchAction {
    pub args: ShellDispatchArgs,
}

#[async_trait]
impl TransitionAction for ShellDispatchAction {
    async fn execute(
        &self,
        net: &Net,
        color_descriptor: &ColorDescriptor,
        active_tokens: &[u64],
        services: &Services,
    ) -> Result<Vec<Token>> {
        let outputs = MergeAction
            .execute(net, color_descriptor, active_tokens, services)
            .await?;

        let mut options = self.args.executor_options.clone();
        if options.user_id.is_none() {
            options.user_id = constant_as(net, "user_id").await?;
        }
        if options.group_id.is_none() {
            options.group_id = constant_as(net, "group_id").await?;
        }
        if options.environment.is_empty() {
            if let Some(environment) = constant_as::<BTreeMap<String, String>>(net, "environment").await? {
                options.environment = environment;
            }
        }
        if options.working_directory.is_none() {
            options.working_directory = constant_as(net, "working_directory")
                .await?
                .or_else(|| Some("/tmp".to_string()));
        }

        let message = Message::Submit {
            command_line: self.args.command_line.clone(),
            net_key: net.key().to_string(),
            response_places: self.args.response_places.clone(),
            color: color_descriptor.color,
            color_group_idx: color_descriptor.group.idx,
            executor_options: options,
        };

        debug!(
            net_key = net.key(),
            color = color_descriptor.color,
            "dispatching shell command"
        );
        services
            .publisher
            .publish(
                &services.routes.exchange,
                &services.routes.shell_submit,
                &message,
            )
            .await?;

        Ok(outputs)
    }
}

async fn constant_as<T: serde::de::DeserializeOwned>(net: &Net, key: &str) -> Result<Option<T>> {
    match net.constant(key).await? {
        None => Ok(None),
        Some(value) => Ok(serde_json::from_value(value).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_json() {
        let kind = TransitionKind::ShellDispatch(ShellDispatchArgs {
            command_line: vec!["ls".into(), "-al".into()],
            response_places: BTreeMap::from([("pre_dispatch".into(), 3)]),
            executor_options: ExecutorOptions::default(),
        });
        let raw = serde_json::to_string(&kind).unwrap();
        let back: TransitionKind = serde_json::from_str(&raw).unwrap();
        assert_eq!(kind, back);
    }

    #[test]
    fn rebase_shifts_response_places_only() {
        let mut kind = TransitionKind::ShellDispatch(ShellDispatchArgs {
            command_line: vec!["df".into()],
            response_places: BTreeMap::from([
                ("pre_dispatch".into(), 1),
                ("post_dispatch_success".into(), 2),
            ]),
            executor_options: ExecutorOptions::default(),
        });
        kind.rebase_places(10);
        match kind {
            TransitionKind::ShellDispatch(args) => {
                assert_eq!(args.response_places["pre_dispatch"], 11);
                assert_eq!(args.response_places["post_dispatch_success"], 12);
                assert_eq!(args.command_line, vec!["df".to_string()]);
            }
            _ => unreachable!(),
        }

        let mut merge = TransitionKind::Merge;
        merge.rebase_places(10);
        assert_eq!(merge, TransitionKind::Merge);
    }
}
