// Redis store implementation
// Lua scripts give the firing protocol its atomicity across workers

//! # Redis Store
//!
//! Production implementation of [`Store`] on top of Redis. Plain primitives
//! map one-to-one onto Redis commands; the two scripted operations run as
//! Lua scripts, which Redis executes atomically with respect to every other
//! command and script. That atomicity is what lets multiple orchestrator
//! workers race on the same transition safely.
//!
//! Connections go through a [`ConnectionManager`], which transparently
//! reconnects; individual command failures surface as transient store
//! errors and resolve through bus redelivery.

use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;

use super::{
    ConsumeOutcome, ConsumeTokensRequest, PutTokenOutcome, PutTokenRequest, Store,
};
use crate::{FlowError, Result};

/// Inserts a marking unless the (color, place) pair is taken, bumping the
/// group count alongside. Returns `{0, token_idx}` on insert and
/// `{1, occupying_token_idx}` when already marked.
const PUT_TOKEN_LUA: &str = r#"
local field = ARGV[3] .. ':' .. ARGV[1]
local existing = redis.call('HGET', KEYS[1], field)
if existing then
    return {1, tonumber(existing)}
end
redis.call('HSET', KEYS[1], field, ARGV[2])
redis.call('HINCRBY', KEYS[2], ARGV[4] .. ':' .. ARGV[1], 1)
return {0, tonumber(ARGV[2])}
"#;

/// The atomic pre-firing step. Return codes:
/// 0 = ready (markings consumed, state now firing)
/// 1 = not ready (enabler recorded, nothing consumed)
/// 2 = enabler already recorded
/// 3 = already fired
const CONSUME_TOKENS_LUA: &str = r#"
local state = redis.call('GET', KEYS[1])
if state == 'fired' then
    return {3}
end

if redis.call('HSETNX', KEYS[6], ARGV[3] .. ':' .. ARGV[1], 1) == 0 then
    return {2}
end

local arcs_in = redis.call('SMEMBERS', KEYS[3])
local consumed = {}
for i, place_idx in ipairs(arcs_in) do
    local token_idx = redis.call('HGET', KEYS[4], ARGV[3] .. ':' .. place_idx)
    if not token_idx then
        return {1}
    end
    consumed[i] = {place_idx, token_idx}
end

for _, entry in ipairs(consumed) do
    redis.call('HDEL', KEYS[4], ARGV[3] .. ':' .. entry[1])
    local group_field = ARGV[2] .. ':' .. entry[1]
    local remaining = redis.call('HINCRBY', KEYS[5], group_field, -1)
    if remaining <= 0 then
        redis.call('HDEL', KEYS[5], group_field)
    end
    redis.call('SADD', KEYS[2], entry[2])
end

redis.call('SET', KEYS[1], 'firing')
return {0}
"#;

lazy_static! {
    static ref PUT_TOKEN_SCRIPT: redis::Script = redis::Script::new(PUT_TOKEN_LUA);
    static ref CONSUME_TOKENS_SCRIPT: redis::Script = redis::Script::new(CONSUME_TOKENS_LUA);
}

/// Redis-backed implementation of [`Store`]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to the given redis URL (`redis://host[:port]/[db]`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(FlowError::store)?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(FlowError::store)?;
        Ok(Self { connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn().get(key).await.map_err(FlowError::store)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn().set(key, value).await.map_err(FlowError::store)
    }

    async fn setnx(&self, key: &str, value: &str) -> Result<bool> {
        self.conn()
            .set_nx(key, value)
            .await
            .map_err(FlowError::store)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn().del(key).await.map_err(FlowError::store)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.conn().hget(key, field).await.map_err(FlowError::store)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.conn()
            .hset(key, field, value)
            .await
            .map_err(FlowError::store)
    }

    async fn hset_many(&self, key: &str, entries: &[(&str, String)]) -> Result<()> {
        let items: Vec<(&str, &str)> = entries
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        self.conn()
            .hset_multiple(key, &items)
            .await
            .map_err(FlowError::store)
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.conn()
            .hset_nx(key, field, value)
            .await
            .map_err(FlowError::store)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.conn()
            .hincr(key, field, delta)
            .await
            .map_err(FlowError::store)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        self.conn()
            .hdel(key, field)
            .await
            .map_err(FlowError::store)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.conn().hgetall(key).await.map_err(FlowError::store)
    }

    async fn sadd(&self, key: &str, member: u64) -> Result<bool> {
        self.conn()
            .sadd(key, member)
            .await
            .map_err(FlowError::store)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<u64>> {
        self.conn().smembers(key).await.map_err(FlowError::store)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .rpush(key, value)
            .await
            .map_err(FlowError::store)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        self.conn()
            .lrange(key, 0, -1)
            .await
            .map_err(FlowError::store)
    }

    async fn put_token(&self, request: PutTokenRequest<'_>) -> Result<PutTokenOutcome> {
        let mut connection = self.conn();
        let reply: Vec<i64> = PUT_TOKEN_SCRIPT
            .key(request.color_marking_key)
            .key(request.group_marking_key)
            .arg(request.place_idx)
            .arg(request.token_idx)
            .arg(request.color)
            .arg(request.color_group_idx)
            .invoke_async(&mut connection)
            .await
            .map_err(FlowError::store)?;

        match reply.as_slice() {
            [0, _] => Ok(PutTokenOutcome::Marked),
            [1, existing] => Ok(PutTokenOutcome::AlreadyMarked {
                token_idx: *existing as u64,
            }),
            other => Err(FlowError::store(anyhow::anyhow!(
                "unexpected put_token reply: {:?}",
                other
            ))),
        }
    }

    async fn consume_tokens(&self, request: ConsumeTokensRequest<'_>) -> Result<ConsumeOutcome> {
        let mut connection = self.conn();
        let reply: Vec<i64> = CONSUME_TOKENS_SCRIPT
            .key(request.state_key)
            .key(request.active_tokens_key)
            .key(request.arcs_in_key)
            .key(request.color_marking_key)
            .key(request.group_marking_key)
            .key(request.enablers_key)
            .arg(request.enabler)
            .arg(request.color_group_idx)
            .arg(request.color)
            .invoke_async(&mut connection)
            .await
            .map_err(FlowError::store)?;

        match reply.first().copied() {
            Some(0) => Ok(ConsumeOutcome::Ready),
            Some(1) => Ok(ConsumeOutcome::NotReady),
            Some(2) => Ok(ConsumeOutcome::AlreadyEnabled),
            Some(3) => Ok(ConsumeOutcome::AlreadyFired),
            other => Err(FlowError::store(anyhow::anyhow!(
                "unexpected consume_tokens reply: {:?}",
                other
            ))),
        }
    }
}
