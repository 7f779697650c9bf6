// In-memory store implementation for development and testing

//! # In-Memory Store
//!
//! Keeps the whole keyspace inside a single mutex so the scripted
//! operations are trivially atomic: they run with the lock held, exactly as
//! a Lua script runs with the Redis event loop held. Nothing suspends while
//! the lock is taken, so the async trait methods never block the executor.
//!
//! Data is lost on restart and cannot be shared across processes; use
//! [`crate::RedisStore`] for distributed deployments.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use super::{
    enabler_field, marking_field, ConsumeOutcome, ConsumeTokensRequest, PutTokenOutcome,
    PutTokenRequest, Store,
};
use crate::{FlowError, Result};

/// One slot in the keyspace. Type confusion (e.g. `hget` on a set) is a
/// programming error and reported as a store error.
#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(BTreeSet<u64>),
    List(Vec<String>),
}

/// Thread-safe in-memory implementation of [`Store`]
#[derive(Default)]
pub struct MemoryStore {
    keyspace: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrong_type(key: &str) -> FlowError {
        FlowError::store(anyhow::anyhow!("wrong value type at key {}", key))
    }
}

fn hash_entry<'a>(
    keyspace: &'a mut HashMap<String, Value>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>> {
    match keyspace
        .entry(key.to_string())
        .or_insert_with(|| Value::Hash(HashMap::new()))
    {
        Value::Hash(hash) => Ok(hash),
        _ => Err(MemoryStore::wrong_type(key)),
    }
}

fn set_entry<'a>(
    keyspace: &'a mut HashMap<String, Value>,
    key: &str,
) -> Result<&'a mut BTreeSet<u64>> {
    match keyspace
        .entry(key.to_string())
        .or_insert_with(|| Value::Set(BTreeSet::new()))
    {
        Value::Set(set) => Ok(set),
        _ => Err(MemoryStore::wrong_type(key)),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let keyspace = self.keyspace.lock().unwrap();
        match keyspace.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().unwrap();
        keyspace.insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn setnx(&self, key: &str, value: &str) -> Result<bool> {
        let mut keyspace = self.keyspace.lock().unwrap();
        if keyspace.contains_key(key) {
            return Ok(false);
        }
        keyspace.insert(key.to_string(), Value::Str(value.to_string()));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().unwrap();
        keyspace.remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let keyspace = self.keyspace.lock().unwrap();
        match keyspace.get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().unwrap();
        hash_entry(&mut keyspace, key)?.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_many(&self, key: &str, entries: &[(&str, String)]) -> Result<()> {
        let mut keyspace = self.keyspace.lock().unwrap();
        let hash = hash_entry(&mut keyspace, key)?;
        for (field, value) in entries {
            hash.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut keyspace = self.keyspace.lock().unwrap();
        let hash = hash_entry(&mut keyspace, key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        Ok(true)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut keyspace = self.keyspace.lock().unwrap();
        let hash = hash_entry(&mut keyspace, key)?;
        let current: i64 = hash
            .get(field)
            .map(|v| v.parse())
            .transpose()
            .map_err(|e| FlowError::store(anyhow::anyhow!("non-integer hash field: {}", e)))?
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().unwrap();
        if let Some(Value::Hash(hash)) = keyspace.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let keyspace = self.keyspace.lock().unwrap();
        match keyspace.get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn sadd(&self, key: &str, member: u64) -> Result<bool> {
        let mut keyspace = self.keyspace.lock().unwrap();
        Ok(set_entry(&mut keyspace, key)?.insert(member))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<u64>> {
        let keyspace = self.keyspace.lock().unwrap();
        match keyspace.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().copied().collect()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut keyspace = self.keyspace.lock().unwrap();
        match keyspace
            .entry(key.to_string())
            .or_insert_with(|| Value::List(Vec::new()))
        {
            Value::List(list) => {
                list.push(value.to_string());
                Ok(())
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        let keyspace = self.keyspace.lock().unwrap();
        match keyspace.get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(list.clone()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn put_token(&self, request: PutTokenRequest<'_>) -> Result<PutTokenOutcome> {
        let mut keyspace = self.keyspace.lock().unwrap();

        let field = marking_field(request.color, request.place_idx);
        let marking = hash_entry(&mut keyspace, request.color_marking_key)?;
        if let Some(existing) = marking.get(&field) {
            let token_idx = existing
                .parse()
                .map_err(|e| FlowError::store(anyhow::anyhow!("corrupt marking: {}", e)))?;
            return Ok(PutTokenOutcome::AlreadyMarked { token_idx });
        }
        marking.insert(field, request.token_idx.to_string());

        let group_field = marking_field(request.color_group_idx, request.place_idx);
        let groups = hash_entry(&mut keyspace, request.group_marking_key)?;
        let count: i64 = groups
            .get(&group_field)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        groups.insert(group_field, (count + 1).to_string());

        Ok(PutTokenOutcome::Marked)
    }

    async fn consume_tokens(&self, request: ConsumeTokensRequest<'_>) -> Result<ConsumeOutcome> {
        let mut keyspace = self.keyspace.lock().unwrap();

        // 1. Already fired for this color?
        if let Some(Value::Str(state)) = keyspace.get(request.state_key) {
            if state == "fired" {
                return Ok(ConsumeOutcome::AlreadyFired);
            }
        }

        // 2. Record the enabler; a duplicate notification stops here.
        let enabler_entry = enabler_field(request.color, request.enabler);
        let enablers = hash_entry(&mut keyspace, request.enablers_key)?;
        if enablers.contains_key(&enabler_entry) {
            return Ok(ConsumeOutcome::AlreadyEnabled);
        }
        enablers.insert(enabler_entry, "1".to_string());

        // 3. Every input arc must be marked for this color.
        let arcs_in: Vec<u64> = match keyspace.get(request.arcs_in_key) {
            None => Vec::new(),
            Some(Value::Set(set)) => set.iter().copied().collect(),
            Some(_) => return Err(Self::wrong_type(request.arcs_in_key)),
        };

        let mut consumed: Vec<(u64, u64)> = Vec::with_capacity(arcs_in.len());
        {
            let marking = hash_entry(&mut keyspace, request.color_marking_key)?;
            for place_idx in &arcs_in {
                let field = marking_field(request.color, *place_idx);
                match marking.get(&field) {
                    None => return Ok(ConsumeOutcome::NotReady),
                    Some(token) => {
                        let token_idx = token.parse().map_err(|e| {
                            FlowError::store(anyhow::anyhow!("corrupt marking: {}", e))
                        })?;
                        consumed.push((*place_idx, token_idx));
                    }
                }
            }
        }

        // 4. Consume: delete markings, decrement group counts, record the
        // active tokens, advance to firing.
        for (place_idx, token_idx) in &consumed {
            if let Some(Value::Hash(marking)) = keyspace.get_mut(request.color_marking_key) {
                marking.remove(&marking_field(request.color, *place_idx));
            }
            let group_field = marking_field(request.color_group_idx, *place_idx);
            let groups = hash_entry(&mut keyspace, request.group_marking_key)?;
            let count: i64 = groups
                .get(&group_field)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if count - 1 <= 0 {
                groups.remove(&group_field);
            } else {
                groups.insert(group_field, (count - 1).to_string());
            }
            set_entry(&mut keyspace, request.active_tokens_key)?.insert(*token_idx);
        }

        keyspace.insert(
            request.state_key.to_string(),
            Value::Str("firing".to_string()),
        );

        Ok(ConsumeOutcome::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_request<'a>(place_idx: u64, token_idx: u64, color: u64) -> PutTokenRequest<'a> {
        PutTokenRequest {
            color_marking_key: "n:color_marking",
            group_marking_key: "n:group_marking",
            place_idx,
            token_idx,
            color,
            color_group_idx: 0,
        }
    }

    fn consume_request<'a>(enabler: u64, color: u64) -> ConsumeTokensRequest<'a> {
        ConsumeTokensRequest {
            state_key: "n:T:0:state:0",
            active_tokens_key: "n:T:0:active_tokens:0",
            arcs_in_key: "n:T:0:arcs_in",
            color_marking_key: "n:color_marking",
            group_marking_key: "n:group_marking",
            enablers_key: "n:T:0:enablers",
            enabler,
            color_group_idx: 0,
            color,
        }
    }

    #[tokio::test]
    async fn put_token_marks_and_counts() {
        let store = MemoryStore::new();
        let outcome = store.put_token(put_request(0, 10, 0)).await.unwrap();
        assert_eq!(outcome, PutTokenOutcome::Marked);

        assert_eq!(
            store.hget("n:color_marking", "0:0").await.unwrap(),
            Some("10".to_string())
        );
        assert_eq!(
            store.hget("n:group_marking", "0:0").await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn put_token_is_idempotent() {
        let store = MemoryStore::new();
        store.put_token(put_request(0, 10, 0)).await.unwrap();

        let outcome = store.put_token(put_request(0, 10, 0)).await.unwrap();
        assert_eq!(outcome, PutTokenOutcome::AlreadyMarked { token_idx: 10 });
        // The group count is untouched by the duplicate.
        assert_eq!(
            store.hget("n:group_marking", "0:0").await.unwrap(),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn put_token_reports_the_occupying_token() {
        let store = MemoryStore::new();
        store.put_token(put_request(0, 10, 0)).await.unwrap();
        let outcome = store.put_token(put_request(0, 11, 0)).await.unwrap();
        assert_eq!(outcome, PutTokenOutcome::AlreadyMarked { token_idx: 10 });
    }

    #[tokio::test]
    async fn consume_not_ready_records_the_enabler() {
        let store = MemoryStore::new();
        store.sadd("n:T:0:arcs_in", 0).await.unwrap();
        store.sadd("n:T:0:arcs_in", 1).await.unwrap();
        store.put_token(put_request(0, 10, 0)).await.unwrap();

        let outcome = store.consume_tokens(consume_request(0, 0)).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::NotReady);

        // Same enabler again: recorded, so AlreadyEnabled, no re-check.
        let outcome = store.consume_tokens(consume_request(0, 0)).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::AlreadyEnabled);

        // The marking at place 0 is still there.
        assert!(store
            .hget("n:color_marking", "0:0")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn consume_ready_takes_every_input_marking() {
        let store = MemoryStore::new();
        store.sadd("n:T:0:arcs_in", 0).await.unwrap();
        store.sadd("n:T:0:arcs_in", 1).await.unwrap();
        store.put_token(put_request(0, 10, 0)).await.unwrap();
        store.put_token(put_request(1, 11, 0)).await.unwrap();

        let outcome = store.consume_tokens(consume_request(1, 0)).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::Ready);

        assert!(store
            .hget("n:color_marking", "0:0")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .hget("n:color_marking", "0:1")
            .await
            .unwrap()
            .is_none());
        // Group counts drop back to absent.
        assert!(store.hget("n:group_marking", "0:0").await.unwrap().is_none());
        assert_eq!(
            store.smembers("n:T:0:active_tokens:0").await.unwrap(),
            vec![10, 11]
        );
        assert_eq!(
            store.get("n:T:0:state:0").await.unwrap(),
            Some("firing".to_string())
        );
    }

    #[tokio::test]
    async fn consume_after_fired_is_a_no_op() {
        let store = MemoryStore::new();
        store.sadd("n:T:0:arcs_in", 0).await.unwrap();
        store.set("n:T:0:state:0", "fired").await.unwrap();
        store.put_token(put_request(0, 10, 0)).await.unwrap();

        let outcome = store.consume_tokens(consume_request(0, 0)).await.unwrap();
        assert_eq!(outcome, ConsumeOutcome::AlreadyFired);
        // Marking untouched.
        assert!(store
            .hget("n:color_marking", "0:0")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn hash_and_key_primitives() {
        let store = MemoryStore::new();
        store.hset("h", "a", "1").await.unwrap();
        store.hset("h", "b", "2").await.unwrap();

        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["a"], "1");

        store.hdel("h", "a").await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), None);

        store.set("k", "v").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn setnx_guards_write_once_values() {
        let store = MemoryStore::new();
        assert!(store.setnx("k", "a").await.unwrap());
        assert!(!store.setnx("k", "b").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));

        assert!(store.hsetnx("h", "f", "a").await.unwrap());
        assert!(!store.hsetnx("h", "f", "b").await.unwrap());
    }
}
