// Orchestrator message handlers - the token lifecycle

//! # Orchestrator Handler
//!
//! Handles the four net-driving message kinds:
//!
//! - `CreateToken`: mint a token in the store, place it, announce the place
//! - `SetToken`: place an already-minted token, announce the place
//! - `NotifyPlace`: fan a marked (color, place) out to its transitions
//! - `NotifyTransition`: run the atomic firing protocol
//!
//! Each handler is idempotent under duplicate delivery: the marking script
//! absorbs re-puts of the same token, and `consume_tokens` absorbs repeated
//! notifications. Concurrent workers can process any mix of these messages
//! against the same net.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::broker::MessageHandler;
use crate::petri::Net;
use crate::protocol::Message;
use crate::services::Services;
use crate::{FlowError, Result};

/// Stateless handler for the petri.* queues
#[derive(Debug, Default)]
pub struct OrchestratorHandler;

impl OrchestratorHandler {
    pub fn new() -> Self {
        Self
    }

    async fn publish_notify_place(
        &self,
        services: &Services,
        net_key: &str,
        place_idx: u64,
        color: u64,
    ) -> Result<()> {
        services
            .publisher
            .publish(
                &services.routes.exchange,
                &services.routes.notify_place,
                &Message::NotifyPlace {
                    net_key: net_key.to_string(),
                    place_idx,
                    color,
                },
            )
            .await
    }
}

#[async_trait]
impl MessageHandler for OrchestratorHandler {
    async fn handle(&self, message: &Message, services: &Services) -> Result<()> {
        match message {
            Message::CreateToken {
                net_key,
                place_idx,
                color,
                color_group_idx,
                data,
            } => {
                let net = Net::attach(services.store.clone(), net_key.clone());
                let token = net
                    .create_token(*color, *color_group_idx, data.clone())
                    .await?;
                net.put_token(*place_idx, &token).await?;
                info!(
                    %net_key,
                    place_idx,
                    color,
                    token_idx = token.index(),
                    "token created"
                );
                self.publish_notify_place(services, net_key, *place_idx, *color)
                    .await
            }

            Message::SetToken {
                net_key,
                place_idx,
                token_idx,
            } => {
                let net = Net::attach(services.store.clone(), net_key.clone());
                let token = net.token(*token_idx);
                let color = token.color().await?;
                net.put_token(*place_idx, &token).await?;
                debug!(%net_key, place_idx, token_idx, "token set");
                self.publish_notify_place(services, net_key, *place_idx, color)
                    .await
            }

            Message::NotifyPlace {
                net_key,
                place_idx,
                color,
            } => {
                let net = Net::attach(services.store.clone(), net_key.clone());
                net.notify_place(*place_idx, *color, services).await
            }

            Message::NotifyTransition {
                net_key,
                transition_idx,
                place_idx,
                token_idx,
            } => {
                let net = Net::attach(services.store.clone(), net_key.clone());
                net.notify_transition(*transition_idx, *place_idx, *token_idx, services)
                    .await
            }

            other => Err(FlowError::InvalidMessage(format!(
                "orchestrator cannot handle {}",
                other.class_name()
            ))),
        }
    }
}
