// Colored Petri net model
// Construction, lookup, and atomic mutation via store scripts

//! # Petri Net Model
//!
//! The domain model of the orchestrator: a colored Petri net persisted in
//! the key-value store. Places hold at most one token per color; transitions
//! consume input-arc tokens atomically and emit output tokens; colors
//! partition concurrent instances of a workflow and color groups model
//! nested parallel scopes as contiguous color ranges.
//!
//! Everything here is a *handle*: a key into the store plus the operations
//! valid on the data behind it. Tokens and nets reference each other by
//! opaque key, never by in-memory pointer, so the object graph stays
//! acyclic and any worker can pick up any message.
//!
//! ## Module Layout
//!
//! - [`net`]: the [`Net`] aggregate - counters, markings, constants,
//!   notification entry points
//! - [`place`] / [`transition`] / [`token`]: element handles
//! - [`color`]: [`ColorGroup`] and [`ColorDescriptor`]
//! - [`actions`]: what a transition does when it fires
//! - [`builder`]: in-memory construction and subnet splicing

pub mod actions;
pub mod builder;
pub mod color;
pub mod net;
pub mod place;
pub mod token;
pub mod transition;

pub use actions::{ShellDispatchArgs, TransitionAction, TransitionKind};
pub use builder::{NetBuilder, TransitionSpec};
pub use color::{ColorDescriptor, ColorGroup};
pub use net::Net;
pub use place::Place;
pub use token::Token;
pub use transition::{Transition, TransitionState};
