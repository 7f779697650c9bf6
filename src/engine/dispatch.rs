// Dispatch handler - bridges orchestrator tokens to external executors

//! # Dispatch Handler
//!
//! Consumes `Submit` messages from the shell-command queue. The flow is:
//! put a token into the `pre_dispatch` response place, invoke the executor,
//! then put a token carrying the returned job id into
//! `post_dispatch_success` or `post_dispatch_failure`. Response tokens are
//! minted here (the handler has store access) and placed by publishing
//! `SetToken` back to the orchestrator, keeping all marking mutations on
//! the orchestrator's atomic path.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::broker::MessageHandler;
use crate::engine::executor::ShellCommandExecutor;
use crate::petri::Net;
use crate::protocol::Message;
use crate::services::Services;
use crate::{FlowError, Result};

/// Handler for the shell-command submit queue
pub struct DispatchHandler {
    executor: Arc<dyn ShellCommandExecutor>,
}

impl DispatchHandler {
    pub fn new(executor: Arc<dyn ShellCommandExecutor>) -> Self {
        Self { executor }
    }

    /// Mint a response token and publish a `SetToken` placing it, if the
    /// workflow asked for this response place at all.
    async fn set_token(
        &self,
        net: &Net,
        response_places: &BTreeMap<String, u64>,
        response: &str,
        color: u64,
        color_group_idx: u64,
        data: Option<serde_json::Value>,
        services: &Services,
    ) -> Result<()> {
        let place_idx = match response_places.get(response) {
            Some(place_idx) => *place_idx,
            None => return Ok(()),
        };

        let token = net.create_token(color, color_group_idx, data).await?;
        services
            .publisher
            .publish(
                &services.routes.exchange,
                &services.routes.set_token,
                &Message::SetToken {
                    net_key: net.key().to_string(),
                    place_idx,
                    token_idx: token.index(),
                },
            )
            .await
    }
}

#[async_trait]
impl MessageHandler for DispatchHandler {
    async fn handle(&self, message: &Message, services: &Services) -> Result<()> {
        let (command_line, net_key, response_places, color, color_group_idx, executor_options) =
            match message {
                Message::Submit {
                    command_line,
                    net_key,
                    response_places,
                    color,
                    color_group_idx,
                    executor_options,
                } => (
                    command_line,
                    net_key,
                    response_places,
                    *color,
                    *color_group_idx,
                    executor_options,
                ),
                other => {
                    return Err(FlowError::InvalidMessage(format!(
                        "dispatch cannot handle {}",
                        other.class_name()
                    )))
                }
            };

        debug!(%net_key, ?command_line, "dispatching");
        let net = Net::attach(services.store.clone(), net_key.clone());

        self.set_token(
            &net,
            response_places,
            "pre_dispatch",
            color,
            color_group_idx,
            None,
            services,
        )
        .await?;

        let (job_id, success) = self.executor.execute(command_line, executor_options).await?;

        let response = if success {
            "post_dispatch_success"
        } else {
            "post_dispatch_failure"
        };
        info!(%net_key, job_id, success, "dispatch finished");

        self.set_token(
            &net,
            response_places,
            response,
            color,
            color_group_idx,
            Some(json!({ "job_id": job_id })),
            services,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Publisher;
    use crate::services::{Routes, ServiceContext};
    use crate::store::{MemoryStore, Store};
    use std::sync::Mutex;

    /// Captures publishes instead of routing them anywhere
    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Message)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            _exchange: &str,
            routing_key: &str,
            message: &Message,
        ) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((routing_key.to_string(), message.clone()));
            Ok(())
        }
    }

    /// Executor stub answering a fixed (job_id, success)
    struct StubExecutor {
        job_id: u64,
        success: bool,
    }

    #[async_trait]
    impl ShellCommandExecutor for StubExecutor {
        async fn execute(
            &self,
            _command_line: &[String],
            _options: &crate::protocol::ExecutorOptions,
        ) -> Result<(u64, bool)> {
            Ok((self.job_id, self.success))
        }
    }

    async fn run_submit(success: bool) -> (Arc<RecordingPublisher>, Net) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let net = Net::create(store.clone(), "dispatch-test").await.unwrap();
        for name in ["pre", "ok", "fail"] {
            net.add_place(name).await.unwrap();
        }
        net.add_color_group(1, None, None).await.unwrap();

        let publisher = Arc::new(RecordingPublisher::default());
        let context = ServiceContext::new(store, Routes::default());
        let services = context.services(publisher.clone());

        let handler = DispatchHandler::new(Arc::new(StubExecutor {
            job_id: 4242,
            success,
        }));
        let message = Message::Submit {
            command_line: vec!["my".into(), "command".into(), "line".into()],
            net_key: net.key().to_string(),
            response_places: BTreeMap::from([
                ("pre_dispatch".into(), 0),
                ("post_dispatch_success".into(), 1),
                ("post_dispatch_failure".into(), 2),
            ]),
            color: 0,
            color_group_idx: 0,
            executor_options: Default::default(),
        };
        handler.handle(&message, &services).await.unwrap();
        (publisher, net)
    }

    #[tokio::test]
    async fn success_places_tokens_before_and_after_dispatch() {
        let (publisher, net) = run_submit(true).await;
        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 2);

        // First the pre_dispatch token, then the success token.
        match &published[0].1 {
            Message::SetToken { place_idx, .. } => assert_eq!(*place_idx, 0),
            other => panic!("unexpected message: {:?}", other),
        }
        match &published[1].1 {
            Message::SetToken {
                place_idx,
                token_idx,
                ..
            } => {
                assert_eq!(*place_idx, 1);
                let data = net.token(*token_idx).data().await.unwrap().unwrap();
                assert_eq!(data["job_id"], 4242);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failure_routes_to_the_failure_place() {
        let (publisher, _net) = run_submit(false).await;
        let published = publisher.published.lock().unwrap().clone();
        match &published[1].1 {
            Message::SetToken { place_idx, .. } => assert_eq!(*place_idx, 2),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_submit_messages_are_invalid() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let context = ServiceContext::new(store, Routes::default());
        let services = context.services(Arc::new(RecordingPublisher::default()));
        let handler = DispatchHandler::new(Arc::new(StubExecutor {
            job_id: 0,
            success: true,
        }));

        let err = handler
            .handle(
                &Message::NotifyPlace {
                    net_key: "n".into(),
                    place_idx: 0,
                    color: 0,
                },
                &services,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvalidMessage(_)));
    }
}
