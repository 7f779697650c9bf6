// Explicit service wiring
// Handlers receive a closed, enumerable set of collaborators

//! # Services
//!
//! Every message handler operates on the same small set of collaborators:
//! the key-value store, a message publisher, and the routing table. Instead
//! of process-wide singletons they travel as an explicit [`Services`] value
//! built per delivery, so a handler's outbound publishes can be attributed
//! to the inbound message that caused them (which is what the
//! publisher-confirmation acking strategy keys on).

use serde::Deserialize;
use std::sync::Arc;

use crate::broker::Publisher;
use crate::store::Store;

/// Exchange and routing keys for every message the core publishes.
///
/// Queue bindings in the broker configuration map these back onto queues.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Routes {
    /// Topic exchange all workflow messages go through
    pub exchange: String,
    pub create_token: String,
    pub set_token: String,
    pub notify_place: String,
    pub notify_transition: String,
    pub shell_submit: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            exchange: "workflow".to_string(),
            create_token: "petri.token.create".to_string(),
            set_token: "petri.token.set".to_string(),
            notify_place: "petri.place.notify".to_string(),
            notify_transition: "petri.transition.notify".to_string(),
            shell_submit: "shell.command.submit".to_string(),
        }
    }
}

/// The per-delivery service set handed to handlers and the net model
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn Store>,
    pub routes: Arc<Routes>,
    pub publisher: Arc<dyn Publisher>,
}

/// The delivery-independent half of [`Services`]; the broker pairs it with
/// a publisher bound to the inbound message being handled.
#[derive(Clone)]
pub struct ServiceContext {
    pub store: Arc<dyn Store>,
    pub routes: Arc<Routes>,
}

impl ServiceContext {
    pub fn new(store: Arc<dyn Store>, routes: Routes) -> Self {
        Self {
            store,
            routes: Arc::new(routes),
        }
    }

    /// Bind a publisher to produce the full service set
    pub fn services(&self, publisher: Arc<dyn Publisher>) -> Services {
        Services {
            store: self.store.clone(),
            routes: self.routes.clone(),
            publisher,
        }
    }
}
