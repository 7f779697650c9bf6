// Petriflow - distributed workflow orchestration on colored Petri nets
// Workflows compile into nets of places and transitions persisted in a
// scripted key-value store and driven forward by an AMQP message bus.

//! # Petriflow Library
//!
//! This is the main library crate for Petriflow, a distributed workflow
//! orchestrator whose execution model is a **colored Petri net**. Workflows
//! are compiled into nets of places and transitions; tokens of distinct
//! colors (and color groups, modelling nested parallel scopes) flow through
//! the net. Transitions fire atomically when their input arcs are satisfied,
//! optionally dispatch external shell commands, and emit output tokens that
//! continue the flow.
//!
//! ## Core Components
//!
//! ### Petri Net Model (`petri` module)
//! - [`Net`]: the persistent net - places, transitions, arcs, markings
//! - [`Token`] / [`ColorGroup`]: colored units of flow and nested scopes
//! - [`NetBuilder`]: in-memory construction and subnet splicing
//!
//! ### Store Layer (`store` module)
//! - [`Store`]: typed hash/set/counter primitives plus the two atomic
//!   scripted operations the firing protocol depends on
//! - [`MemoryStore`]: single-process implementation for development/testing
//! - [`RedisStore`]: production implementation backed by Lua scripts
//!
//! ### Orchestration Engine (`engine` module)
//! - [`OrchestratorHandler`]: drives the net forward from bus messages
//! - [`DispatchHandler`]: bridges tokens to external shell-command executors
//!
//! ### Broker Layer (`broker` module)
//! - [`AmqpBroker`]: AMQP 0-9-1 publish/consume over a topic exchange
//! - [`MemoryBroker`]: in-process bus for tests and single-process runs
//! - Acking strategies: [`Immediate`] and [`PublisherConfirmation`], which
//!   delays the ack of an inbound message until every outbound message it
//!   caused has been confirmed by the broker
//!
//! ## Firing Protocol
//!
//! The hard part of the system is the distributed firing protocol. All
//! marking mutations are expressed as single atomic store scripts, so
//! concurrent orchestrator workers can race on the same transition and at
//! most one of them consumes the input tokens. Everything else is idempotent
//! under message re-delivery: duplicated notifications observe
//! `AlreadyEnabled` or `AlreadyFired` and perform no side effects.

// Colored Petri net model: places, transitions, tokens, color groups
pub mod petri;

// Storage abstraction: atomic scripted key-value operations
pub mod store;

// Orchestrator and dispatch message handlers
pub mod engine;

// AMQP broker, acking strategies, in-memory bus, management API
pub mod broker;

// Wire protocol: domain messages and the versioned codec
pub mod protocol;

// Settings loaded from files and the environment
pub mod config;

// Explicit service wiring passed into every handler
pub mod services;

// Re-export core domain types for easy access
pub use petri::{
    ColorDescriptor,   // (color, group) pair identifying a firing
    ColorGroup,        // contiguous color range forming a nested scope
    Net,               // persistent net handle
    NetBuilder,        // in-memory net construction and splicing
    Place,             // place handle
    Token,             // colored token handle
    Transition,        // transition handle
    TransitionKind,    // action attached to a transition
    TransitionState,   // idle -> firing -> fired
};

pub use store::{ConsumeOutcome, MemoryStore, PutTokenOutcome, RedisStore, Store};

pub use engine::{DispatchHandler, ForkExecutor, OrchestratorHandler, ShellCommandExecutor};

pub use broker::{
    acking::{AckingStrategy, Immediate, PublisherConfirmation},
    amqp::AmqpBroker,
    memory::MemoryBroker,
    mgmt::ManagementApi,
    Broker, MessageHandler, Publisher,
};

pub use protocol::{codec, Message};

pub use config::Settings;

pub use services::{Routes, ServiceContext, Services};

// Core error types
use thiserror::Error;

/// Error type for all Petriflow operations
///
/// The first group are workflow-level bugs: re-delivering the message cannot
/// help, so the broker rejects without requeue. Store and bus errors are
/// transient and resolve through the bus's natural redelivery.
#[derive(Error, Debug)]
pub enum FlowError {
    /// Payload failed codec or schema validation
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A token created in one net was placed into another
    #[error("token {token_key} cannot be placed in net {net_key}")]
    ForeignToken { token_key: String, net_key: String },

    /// Place index beyond the net's place counter
    #[error("attempted to put token into place {place_idx} ({num_places} places exist)")]
    PlaceNotFound { place_idx: u64, num_places: u64 },

    /// A different token already marks this (color, place)
    #[error("place {place_idx} is already marked for color {color} by token {existing}")]
    DuplicateToken {
        place_idx: u64,
        color: u64,
        existing: u64,
    },

    /// Write-once counter was already set
    #[error("tried to overwrite counter {0}")]
    CounterOverwrite(String),

    /// Write-once constant was already set
    #[error("tried to overwrite constant {key} in net {net_key}")]
    ConstantOverwrite { key: String, net_key: String },

    /// A net element referenced by index does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Key-value store backend failure
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// Message bus failure
    #[error("bus error: {0}")]
    Bus(#[source] anyhow::Error),

    /// The broker nacked a publish; fatal to the broker process
    #[error("publisher confirm was nacked")]
    PublisherNack,

    /// Configuration loading errors
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// JSON serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors from executors and config files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Wrap a store backend error
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        FlowError::Store(err.into())
    }

    /// Wrap a message bus error
    pub fn bus(err: impl Into<anyhow::Error>) -> Self {
        FlowError::Bus(err.into())
    }

    /// True for workflow-level bugs where redelivery cannot help; the broker
    /// rejects these without requeue instead of letting the bus retry.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FlowError::InvalidMessage(_)
                | FlowError::ForeignToken { .. }
                | FlowError::PlaceNotFound { .. }
                | FlowError::DuplicateToken { .. }
                | FlowError::CounterOverwrite(_)
                | FlowError::ConstantOverwrite { .. }
                | FlowError::NotFound(_)
                | FlowError::Serialization(_)
        )
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, FlowError>;
