// Token handle - a colored unit of flow

use std::sync::Arc;

use crate::store::Store;
use crate::{FlowError, Result};

/// A token persisted under `<net_key>:t:<idx>`.
///
/// Tokens are immutable after creation: color, group and data are written
/// once by [`crate::Net::create_token`] and only read afterwards. The handle
/// carries the index so callers that just created a token do not have to
/// read it back.
#[derive(Clone)]
pub struct Token {
    store: Arc<dyn Store>,
    key: String,
    index: u64,
}

impl Token {
    pub(crate) fn new(store: Arc<dyn Store>, key: String, index: u64) -> Self {
        Self { store, key, index }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// The key of the net this token belongs to. Tokens may only ever be
    /// placed in their own net.
    pub async fn net_key(&self) -> Result<String> {
        self.store
            .hget(&self.key, "net_key")
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("token {}", self.key)))
    }

    pub async fn color(&self) -> Result<u64> {
        self.required_field("color").await
    }

    pub async fn color_group_idx(&self) -> Result<u64> {
        self.required_field("color_group_idx").await
    }

    /// Opaque payload attached at creation, if any
    pub async fn data(&self) -> Result<Option<serde_json::Value>> {
        match self.store.hget(&self.key, "data").await? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    async fn required_field(&self, field: &str) -> Result<u64> {
        let raw = self
            .store
            .hget(&self.key, field)
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("token {} field {}", self.key, field)))?;
        raw.parse()
            .map_err(|e| FlowError::store(anyhow::anyhow!("corrupt token field {}: {}", field, e)))
    }
}
