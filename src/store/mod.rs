// Storage abstraction for the net model
// All multi-key mutations that must be atomic are expressed as scripts

//! # Store Abstraction Layer
//!
//! The key-value store is the only mutable shared resource in the system,
//! so this layer is where marking integrity is won or lost. It exposes two
//! kinds of operation:
//!
//! - **Typed primitives** (hashes, sets, counters, strings, lists) used for
//!   net construction and plain reads. These touch one key at a time.
//! - **Scripted operations** ([`Store::put_token`] and
//!   [`Store::consume_tokens`]) that read and write several keys as a single
//!   atomic step. The firing protocol's correctness hinges on these being
//!   indivisible; splitting them into separate reads and writes is a
//!   correctness bug, not an optimization opportunity.
//!
//! Handlers must never do "read, then write" in separate round-trips against
//! state another handler could race on.
//!
//! ## Implementations
//!
//! - [`MemoryStore`]: the whole keyspace behind one lock, scripts executed
//!   while holding it. For development, tests and single-process runs.
//! - [`RedisStore`]: Lua scripts over a shared connection manager. Redis
//!   executes scripts atomically, which gives the same linearizable
//!   semantics across orchestrator workers.

pub mod memory;
pub mod redis;

pub use self::redis::RedisStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::Result;

/// Result of the atomic `put_token` script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutTokenOutcome {
    /// The (color, place) pair was unmarked; the token is now there and the
    /// group count was incremented.
    Marked,
    /// The pair was already marked. Carries the index of the occupying
    /// token so the caller can tell a re-delivered put (same index, benign)
    /// from a workflow bug (different index).
    AlreadyMarked { token_idx: u64 },
}

/// Result of the atomic `consume_tokens` script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Every input arc was marked; the markings are consumed, the consumed
    /// token indices recorded, and the transition state is now `firing`.
    /// Exactly one caller per (transition, color) ever sees this.
    Ready,
    /// At least one input arc is unmarked. The enabler stays recorded and
    /// the state stays `idle`.
    NotReady,
    /// This enabler was already recorded for this color; duplicate
    /// notification, no side effects.
    AlreadyEnabled,
    /// The transition already fired for this color; no side effects.
    AlreadyFired,
}

/// Arguments for [`Store::put_token`].
///
/// The key pair names the net's marking hashes; everything else is script
/// arguments, mirroring the KEYS/ARGV split of the Lua implementation.
#[derive(Debug, Clone)]
pub struct PutTokenRequest<'a> {
    pub color_marking_key: &'a str,
    pub group_marking_key: &'a str,
    pub place_idx: u64,
    pub token_idx: u64,
    pub color: u64,
    pub color_group_idx: u64,
}

/// Arguments for [`Store::consume_tokens`].
#[derive(Debug, Clone)]
pub struct ConsumeTokensRequest<'a> {
    pub state_key: &'a str,
    pub active_tokens_key: &'a str,
    pub arcs_in_key: &'a str,
    pub color_marking_key: &'a str,
    pub group_marking_key: &'a str,
    pub enablers_key: &'a str,
    pub enabler: u64,
    pub color_group_idx: u64,
    pub color: u64,
}

/// Field name used in both marking hashes: `<tag>:<place_idx>` where the tag
/// is a color (color marking) or a group index (group marking).
pub fn marking_field(tag: u64, place_idx: u64) -> String {
    format!("{}:{}", tag, place_idx)
}

/// Field name recording an enabler for a color in a transition's enablers
/// hash.
pub fn enabler_field(color: u64, enabler: u64) -> String {
    format!("{}:{}", color, enabler)
}

/// Typed operations against the key-value backend.
///
/// All operations are async and fallible; backend failures surface as
/// [`crate::FlowError::Store`] and are treated as transient by the
/// orchestrator. Scripted operations are idempotent in effect: re-execution
/// with the same arguments against the resulting state is a no-op.
#[async_trait]
pub trait Store: Send + Sync {
    // String primitives
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Set only if unset; returns whether the write happened
    async fn setnx(&self, key: &str, value: &str) -> Result<bool>;
    async fn delete(&self, key: &str) -> Result<()>;

    // Hash primitives
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hset_many(&self, key: &str, entries: &[(&str, String)]) -> Result<()>;
    /// Hash-field setnx; returns whether the write happened
    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    // Set primitives (members are net element indices)
    async fn sadd(&self, key: &str, member: u64) -> Result<bool>;
    async fn smembers(&self, key: &str) -> Result<Vec<u64>>;

    // List primitives (used by place observers)
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;

    // Atomic scripted operations
    async fn put_token(&self, request: PutTokenRequest<'_>) -> Result<PutTokenOutcome>;
    async fn consume_tokens(&self, request: ConsumeTokensRequest<'_>) -> Result<ConsumeOutcome>;
}
