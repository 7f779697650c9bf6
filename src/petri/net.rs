// Net handle - the persistent colored Petri net

//! # Net
//!
//! The aggregate root of the model. A net owns its places, transitions,
//! tokens and color groups through hierarchical store keys:
//!
//! ```text
//! <net_key>                 net hash (name)
//! <net_key>:counters        monotonic counters: P, T, t, C, G
//! <net_key>:color_groups    group idx -> JSON ColorGroup
//! <net_key>:color_marking   "<color>:<place>" -> token idx
//! <net_key>:group_marking   "<group>:<place>" -> marked color count
//! <net_key>:constants       write-once workflow configuration
//! <net_key>:variables       mutable workflow state
//! <net_key>:observers       place idx -> observer list keys (JSON array)
//! <net_key>:P:<idx>         place (see Place)
//! <net_key>:T:<idx>         transition (see Transition)
//! <net_key>:t:<idx>         token (see Token)
//! ```
//!
//! The two marking hashes are the heart of the model. `color_marking` has an
//! entry exactly when a token of that color sits at that place;
//! `group_marking` counts, per (group, place), how many of the group's
//! colors are currently marked there, which is what group-wide gating reads.
//! Both are only ever touched by the atomic store scripts.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::petri::actions::TransitionKind;
use crate::petri::color::{ColorDescriptor, ColorGroup};
use crate::petri::place::Place;
use crate::petri::token::Token;
use crate::petri::transition::Transition;
use crate::protocol::Message;
use crate::services::Services;
use crate::store::{marking_field, ConsumeOutcome, PutTokenOutcome, PutTokenRequest, Store};
use crate::{FlowError, Result};

// Counter names, shared with the key layout above
const PLACE_COUNTER: &str = "P";
const TRANSITION_COUNTER: &str = "T";
const TOKEN_COUNTER: &str = "t";
const COLOR_COUNTER: &str = "C";
const COLOR_GROUP_COUNTER: &str = "G";

/// Handle to a net in the store
#[derive(Clone)]
pub struct Net {
    store: Arc<dyn Store>,
    key: String,
}

impl Net {
    /// Attach to an existing net by key
    pub fn attach(store: Arc<dyn Store>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Create a fresh net under a random key
    pub async fn create(store: Arc<dyn Store>, name: &str) -> Result<Self> {
        let net = Self::attach(store, Self::make_key());
        net.store.hset(&net.key, "name", name).await?;
        Ok(net)
    }

    /// Random opaque net key: base64 of a v4 UUID, no padding
    pub fn make_key() -> String {
        URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn name(&self) -> Result<Option<String>> {
        self.store.hget(&self.key, "name").await
    }

    // Subkey helpers

    fn counters_key(&self) -> String {
        format!("{}:counters", self.key)
    }

    fn color_groups_key(&self) -> String {
        format!("{}:color_groups", self.key)
    }

    pub fn color_marking_key(&self) -> String {
        format!("{}:color_marking", self.key)
    }

    pub fn group_marking_key(&self) -> String {
        format!("{}:group_marking", self.key)
    }

    fn constants_key(&self) -> String {
        format!("{}:constants", self.key)
    }

    fn variables_key(&self) -> String {
        format!("{}:variables", self.key)
    }

    fn observers_key(&self) -> String {
        format!("{}:observers", self.key)
    }

    pub fn place_key(&self, idx: u64) -> String {
        format!("{}:P:{}", self.key, idx)
    }

    pub fn transition_key(&self, idx: u64) -> String {
        format!("{}:T:{}", self.key, idx)
    }

    pub fn token_key(&self, idx: u64) -> String {
        format!("{}:t:{}", self.key, idx)
    }

    // Counters

    async fn counter(&self, which: &str) -> Result<u64> {
        Ok(self
            .store
            .hget(&self.counters_key(), which)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn incr_counter(&self, which: &str, by: u64) -> Result<u64> {
        let value = self
            .store
            .hincrby(&self.counters_key(), which, by as i64)
            .await?;
        Ok(value as u64)
    }

    /// Set a counter exactly once; a second set is a workflow bug
    async fn set_counter_once(&self, which: &str, value: u64) -> Result<()> {
        if !self
            .store
            .hsetnx(&self.counters_key(), which, &value.to_string())
            .await?
        {
            return Err(FlowError::CounterOverwrite(which.to_string()));
        }
        Ok(())
    }

    pub async fn num_places(&self) -> Result<u64> {
        self.counter(PLACE_COUNTER).await
    }

    pub async fn num_transitions(&self) -> Result<u64> {
        self.counter(TRANSITION_COUNTER).await
    }

    pub async fn num_colors(&self) -> Result<u64> {
        self.counter(COLOR_COUNTER).await
    }

    pub async fn num_color_groups(&self) -> Result<u64> {
        self.counter(COLOR_GROUP_COUNTER).await
    }

    pub async fn set_num_places(&self, value: u64) -> Result<()> {
        self.set_counter_once(PLACE_COUNTER, value).await
    }

    pub async fn set_num_transitions(&self, value: u64) -> Result<()> {
        self.set_counter_once(TRANSITION_COUNTER, value).await
    }

    // Construction

    pub async fn add_place(&self, name: &str) -> Result<Place> {
        let idx = self.incr_counter(PLACE_COUNTER, 1).await? - 1;
        let place = self.place(idx);
        place.set_name(name).await?;
        Ok(place)
    }

    pub fn place(&self, idx: u64) -> Place {
        Place::new(self.store.clone(), self.place_key(idx), idx)
    }

    pub async fn add_transition(&self, kind: TransitionKind) -> Result<Transition> {
        let idx = self.incr_counter(TRANSITION_COUNTER, 1).await? - 1;
        let transition = self.transition(idx);
        transition.set_kind(&kind).await?;
        Ok(transition)
    }

    pub fn transition(&self, idx: u64) -> Transition {
        Transition::new(self.store.clone(), self.transition_key(idx), idx)
    }

    /// Arc place -> transition. Recorded on both endpoints: the place's
    /// arcs-out drive notifications, the transition's arcs-in drive the
    /// consume check.
    pub async fn add_place_arc_out(&self, place_idx: u64, transition_idx: u64) -> Result<()> {
        self.place(place_idx).add_arc_out(transition_idx).await?;
        self.transition(transition_idx).add_arc_in(place_idx).await
    }

    /// Arc transition -> place
    pub async fn add_trans_arc_out(&self, transition_idx: u64, place_idx: u64) -> Result<()> {
        self.transition(transition_idx).add_arc_out(place_idx).await
    }

    // Tokens and colors

    pub fn token(&self, idx: u64) -> Token {
        Token::new(self.store.clone(), self.token_key(idx), idx)
    }

    pub async fn create_token(
        &self,
        color: u64,
        color_group_idx: u64,
        data: Option<serde_json::Value>,
    ) -> Result<Token> {
        let idx = self.incr_counter(TOKEN_COUNTER, 1).await? - 1;
        let key = self.token_key(idx);

        let mut entries = vec![
            ("net_key", self.key.clone()),
            ("index", idx.to_string()),
            ("color", color.to_string()),
            ("color_group_idx", color_group_idx.to_string()),
        ];
        if let Some(data) = &data {
            entries.push(("data", serde_json::to_string(data)?));
        }
        self.store.hset_many(&key, &entries).await?;

        Ok(Token::new(self.store.clone(), key, idx))
    }

    /// Allocate a new color group of `size` colors, optionally nested under
    /// a parent color and group
    pub async fn add_color_group(
        &self,
        size: u64,
        parent_color: Option<u64>,
        parent_color_group: Option<u64>,
    ) -> Result<ColorGroup> {
        let group_idx = self.incr_counter(COLOR_GROUP_COUNTER, 1).await? - 1;
        let end = self.incr_counter(COLOR_COUNTER, size).await?;
        let begin = end - size;

        let group = ColorGroup {
            idx: group_idx,
            parent_color,
            parent_color_group,
            begin,
            end,
        };
        self.store
            .hset(
                &self.color_groups_key(),
                &group_idx.to_string(),
                &serde_json::to_string(&group)?,
            )
            .await?;
        Ok(group)
    }

    pub async fn color_group(&self, idx: u64) -> Result<ColorGroup> {
        let raw = self
            .store
            .hget(&self.color_groups_key(), &idx.to_string())
            .await?
            .ok_or_else(|| FlowError::NotFound(format!("color group {} in net {}", idx, self.key)))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// The color descriptor of a stored token
    pub async fn color_descriptor(&self, token: &Token) -> Result<ColorDescriptor> {
        let color = token.color().await?;
        let group = self.color_group(token.color_group_idx().await?).await?;
        Ok(ColorDescriptor::new(color, group))
    }

    // Markings

    /// The token currently marking (color, place), if any
    pub async fn marking(&self, color: u64, place_idx: u64) -> Result<Option<u64>> {
        Ok(self
            .store
            .hget(&self.color_marking_key(), &marking_field(color, place_idx))
            .await?
            .and_then(|v| v.parse().ok()))
    }

    /// How many colors of the group currently mark the place
    pub async fn group_marking(&self, group_idx: u64, place_idx: u64) -> Result<u64> {
        Ok(self
            .store
            .hget(&self.group_marking_key(), &marking_field(group_idx, place_idx))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Put a token into a place.
    ///
    /// Rejects tokens that belong to another net and places beyond the
    /// place counter, then runs the atomic marking script. Re-putting the
    /// same token is a no-op; a different token on a marked (color, place)
    /// is a [`FlowError::DuplicateToken`].
    pub async fn put_token(&self, place_idx: u64, token: &Token) -> Result<()> {
        let num_places = self.num_places().await?;
        if place_idx >= num_places {
            return Err(FlowError::PlaceNotFound {
                place_idx,
                num_places,
            });
        }

        let token_net_key = token.net_key().await?;
        if token_net_key != self.key {
            return Err(FlowError::ForeignToken {
                token_key: token.key().to_string(),
                net_key: self.key.clone(),
            });
        }

        let color = token.color().await?;
        let color_marking_key = self.color_marking_key();
        let group_marking_key = self.group_marking_key();
        let outcome = self
            .store
            .put_token(PutTokenRequest {
                color_marking_key: &color_marking_key,
                group_marking_key: &group_marking_key,
                place_idx,
                token_idx: token.index(),
                color,
                color_group_idx: token.color_group_idx().await?,
            })
            .await?;

        match outcome {
            PutTokenOutcome::Marked => Ok(()),
            PutTokenOutcome::AlreadyMarked { token_idx } if token_idx == token.index() => {
                // Re-delivered put of the same token; nothing to do.
                debug!(
                    net_key = %self.key,
                    place_idx,
                    token_idx,
                    "duplicate put of the same token ignored"
                );
                Ok(())
            }
            PutTokenOutcome::AlreadyMarked { token_idx } => Err(FlowError::DuplicateToken {
                place_idx,
                color,
                existing: token_idx,
            }),
        }
    }

    // Observers

    /// Register a store list key to be appended to whenever the place gains
    /// a token; external waiters block on the list to observe progress.
    pub async fn add_place_observer(&self, place_idx: u64, observer_key: &str) -> Result<()> {
        let field = place_idx.to_string();
        let mut keys: Vec<String> = match self.store.hget(&self.observers_key(), &field).await? {
            None => Vec::new(),
            Some(raw) => serde_json::from_str(&raw)?,
        };
        if !keys.iter().any(|k| k == observer_key) {
            keys.push(observer_key.to_string());
        }
        self.store
            .hset(&self.observers_key(), &field, &serde_json::to_string(&keys)?)
            .await
    }

    async fn place_observers(&self, place_idx: u64) -> Result<Vec<String>> {
        match self
            .store
            .hget(&self.observers_key(), &place_idx.to_string())
            .await?
        {
            None => Ok(Vec::new()),
            Some(raw) => Ok(serde_json::from_str(&raw)?),
        }
    }

    // Constants and variables

    pub async fn constant(&self, key: &str) -> Result<Option<serde_json::Value>> {
        match self.store.hget(&self.constants_key(), key).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    /// Constants are write-once workflow configuration
    pub async fn set_constant(&self, key: &str, value: serde_json::Value) -> Result<()> {
        if !self
            .store
            .hsetnx(&self.constants_key(), key, &serde_json::to_string(&value)?)
            .await?
        {
            return Err(FlowError::ConstantOverwrite {
                key: key.to_string(),
                net_key: self.key.clone(),
            });
        }
        Ok(())
    }

    pub async fn variable(&self, key: &str) -> Result<Option<serde_json::Value>> {
        match self.store.hget(&self.variables_key(), key).await? {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        }
    }

    pub async fn set_variable(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.store
            .hset(&self.variables_key(), key, &serde_json::to_string(&value)?)
            .await
    }

    // Notifications

    /// A (color, place) pair may have gained a token: stamp the place,
    /// fan out `NotifyTransition` to every outgoing arc, wake observers.
    ///
    /// If the marking is gone by the time we look (another transition
    /// already consumed it) this is a no-op.
    pub async fn notify_place(
        &self,
        place_idx: u64,
        color: u64,
        services: &Services,
    ) -> Result<()> {
        let token_idx = match self.marking(color, place_idx).await? {
            Some(token_idx) => token_idx,
            None => {
                debug!(
                    net_key = %self.key,
                    place_idx, color, "notify_place found no marking"
                );
                return Ok(());
            }
        };

        let place = self.place(place_idx);
        place.stamp_first_token_timestamp().await?;

        for transition_idx in place.arcs_out().await? {
            services
                .publisher
                .publish(
                    &services.routes.exchange,
                    &services.routes.notify_transition,
                    &Message::NotifyTransition {
                        net_key: self.key.clone(),
                        transition_idx,
                        place_idx,
                        token_idx,
                    },
                )
                .await?;
        }

        for observer_key in self.place_observers(place_idx).await? {
            self.store
                .rpush(&observer_key, &marking_field(color, place_idx))
                .await?;
        }

        Ok(())
    }

    /// Attempt to fire a transition: the atomic consume, then the action,
    /// then pushing outputs and notifying downstream places.
    ///
    /// Outputs are pushed and the state advanced to `fired` *before* the
    /// downstream notifications go out, so a crash between the two leaves
    /// consistent markings that the next notification can pick up.
    pub async fn notify_transition(
        &self,
        transition_idx: u64,
        place_idx: u64,
        token_idx: u64,
        services: &Services,
    ) -> Result<()> {
        let transition = self.transition(transition_idx);
        let token = self.token(token_idx);
        let color_descriptor = self.color_descriptor(&token).await?;

        let color_marking_key = self.color_marking_key();
        let group_marking_key = self.group_marking_key();
        let outcome = transition
            .consume_tokens(
                place_idx,
                &color_descriptor,
                &color_marking_key,
                &group_marking_key,
            )
            .await?;

        match outcome {
            ConsumeOutcome::Ready => {
                let new_tokens = transition.fire(self, &color_descriptor, services).await?;

                let mut colors = Vec::with_capacity(new_tokens.len());
                for token in &new_tokens {
                    colors.push(token.color().await?);
                }

                transition.push_tokens(self, &new_tokens).await?;
                transition.set_fired(color_descriptor.color).await?;
                transition
                    .notify_places(&self.key, &colors, services)
                    .await?;
            }
            ConsumeOutcome::NotReady
            | ConsumeOutcome::AlreadyEnabled
            | ConsumeOutcome::AlreadyFired => {
                // Expected outcomes of concurrent or duplicated
                // notifications; the handler completes without side effects.
                debug!(
                    net_key = %self.key,
                    transition_idx,
                    color = color_descriptor.color,
                    ?outcome,
                    "transition not fired"
                );
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn counters_allocate_sequential_indices() {
        let net = Net::create(test_store(), "test").await.unwrap();
        let p0 = net.add_place("start").await.unwrap();
        let p1 = net.add_place("end").await.unwrap();
        assert_eq!(p0.index(), 0);
        assert_eq!(p1.index(), 1);
        assert_eq!(net.num_places().await.unwrap(), 2);

        let t0 = net.add_transition(TransitionKind::Merge).await.unwrap();
        assert_eq!(t0.index(), 0);
        assert_eq!(net.num_transitions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counters_are_write_once() {
        let net = Net::create(test_store(), "test").await.unwrap();
        net.set_num_places(4).await.unwrap();
        let err = net.set_num_places(5).await.unwrap_err();
        assert!(matches!(err, FlowError::CounterOverwrite(_)));
    }

    #[tokio::test]
    async fn color_groups_nest() {
        let net = Net::create(test_store(), "test").await.unwrap();
        let root = net.add_color_group(2, None, None).await.unwrap();
        assert_eq!(root.idx, 0);
        assert_eq!((root.begin, root.end), (0, 2));

        let child = net.add_color_group(3, Some(1), Some(root.idx)).await.unwrap();
        assert_eq!(child.idx, 1);
        assert_eq!((child.begin, child.end), (2, 5));
        assert_eq!(child.parent_color, Some(1));
        assert_eq!(child.parent_color_group, Some(0));

        assert_eq!(net.num_colors().await.unwrap(), 5);
        assert_eq!(net.num_color_groups().await.unwrap(), 2);

        let loaded = net.color_group(1).await.unwrap();
        assert_eq!(loaded, child);
    }

    #[tokio::test]
    async fn put_token_rejects_unknown_places() {
        let net = Net::create(test_store(), "test").await.unwrap();
        net.add_place("only").await.unwrap();
        net.add_color_group(1, None, None).await.unwrap();
        let token = net.create_token(0, 0, None).await.unwrap();

        let err = net.put_token(7, &token).await.unwrap_err();
        assert!(matches!(
            err,
            FlowError::PlaceNotFound {
                place_idx: 7,
                num_places: 1
            }
        ));
    }

    #[tokio::test]
    async fn put_token_rejects_foreign_tokens() {
        let store = test_store();
        let net_a = Net::create(store.clone(), "a").await.unwrap();
        let net_b = Net::create(store.clone(), "b").await.unwrap();
        net_a.add_place("p").await.unwrap();
        net_b.add_place("p").await.unwrap();
        net_a.add_color_group(1, None, None).await.unwrap();
        net_b.add_color_group(1, None, None).await.unwrap();

        let foreign = net_b.create_token(0, 0, None).await.unwrap();
        let err = net_a.put_token(0, &foreign).await.unwrap_err();
        assert!(matches!(err, FlowError::ForeignToken { .. }));
    }

    #[tokio::test]
    async fn put_token_enforces_one_token_per_color_place() {
        let net = Net::create(test_store(), "test").await.unwrap();
        net.add_place("p").await.unwrap();
        net.add_color_group(1, None, None).await.unwrap();

        let first = net.create_token(0, 0, None).await.unwrap();
        net.put_token(0, &first).await.unwrap();
        assert_eq!(net.marking(0, 0).await.unwrap(), Some(first.index()));
        assert_eq!(net.group_marking(0, 0).await.unwrap(), 1);

        // Same token again: benign.
        net.put_token(0, &first).await.unwrap();
        assert_eq!(net.group_marking(0, 0).await.unwrap(), 1);

        // Different token: workflow bug.
        let second = net.create_token(0, 0, None).await.unwrap();
        let err = net.put_token(0, &second).await.unwrap_err();
        assert!(matches!(err, FlowError::DuplicateToken { .. }));
    }

    #[tokio::test]
    async fn constants_are_write_once_variables_are_not() {
        let net = Net::create(test_store(), "test").await.unwrap();
        net.set_constant("user_id", serde_json::json!(100))
            .await
            .unwrap();
        assert!(net
            .set_constant("user_id", serde_json::json!(200))
            .await
            .is_err());
        assert_eq!(
            net.constant("user_id").await.unwrap(),
            Some(serde_json::json!(100))
        );

        net.set_variable("phase", serde_json::json!("a")).await.unwrap();
        net.set_variable("phase", serde_json::json!("b")).await.unwrap();
        assert_eq!(
            net.variable("phase").await.unwrap(),
            Some(serde_json::json!("b"))
        );
    }
}
