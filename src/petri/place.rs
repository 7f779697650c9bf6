// Place handle - holds at most one token per color

use chrono::Utc;
use std::sync::Arc;

use crate::store::Store;
use crate::Result;

/// A place persisted under `<net_key>:P:<idx>`.
///
/// The hash behind the key holds `name` and the write-once
/// `first_token_timestamp`; outgoing arcs live in the adjacent
/// `<key>:arcs_out` set of transition indices.
#[derive(Clone)]
pub struct Place {
    store: Arc<dyn Store>,
    key: String,
    index: u64,
}

impl Place {
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

    fn arcs_out_key(&self) -> String {
        format!("{}:arcs_out", self.key)
    }

    /// Transitions this place feeds
    pub async fn arcs_out(&self) -> Result<Vec<u64>> {
        self.store.smembers(&self.arcs_out_key()).await
    }

    pub(crate) async fn add_arc_out(&self, transition_idx: u64) -> Result<()> {
        self.store.sadd(&self.arcs_out_key(), transition_idx).await?;
        Ok(())
    }

    /// Stamp the moment the first token arrived. Write-once: later calls
    /// leave the original stamp untouched and return false.
    pub async fn stamp_first_token_timestamp(&self) -> Result<bool> {
        self.store
            .hsetnx(&self.key, "first_token_timestamp", &Utc::now().to_rfc3339())
            .await
    }

    pub async fn first_token_timestamp(&self) -> Result<Option<String>> {
        self.store.hget(&self.key, "first_token_timestamp").await
    }
}
