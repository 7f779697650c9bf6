// In-memory net construction and subnet splicing

//! # Net Builder
//!
//! Workflows are composed in memory before anything touches the store: a
//! [`NetBuilder`] collects places, transitions and arcs, subnets get spliced
//! into hosts with their indices rebased, and a single
//! [`NetBuilder::store`] call persists the finished structure as a [`Net`].
//!
//! Splicing is how nested workflows compose. The subnet's place and
//! transition indices are shifted by the host's current counts, place
//! references inside transition kinds are rewritten the same way, and one
//! synthetic bridge transition per translation entry routes tokens from a
//! host place into the subnet.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::petri::actions::TransitionKind;
use crate::petri::net::Net;
use crate::store::Store;
use crate::Result;

/// A transition being assembled: display name plus firing behavior
#[derive(Debug, Clone)]
pub struct TransitionSpec {
    pub name: String,
    pub kind: TransitionKind,
}

impl TransitionSpec {
    pub fn new(name: impl Into<String>, kind: TransitionKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// In-memory net under construction
#[derive(Debug, Clone, Default)]
pub struct NetBuilder {
    name: String,
    places: Vec<String>,
    transitions: Vec<TransitionSpec>,
    place_arcs_out: BTreeMap<u64, BTreeSet<u64>>,
    trans_arcs_out: BTreeMap<u64, BTreeSet<u64>>,
}

impl NetBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn add_place(&mut self, name: impl Into<String>) -> u64 {
        self.places.push(name.into());
        (self.places.len() - 1) as u64
    }

    pub fn add_transition(&mut self, spec: TransitionSpec) -> u64 {
        self.transitions.push(spec);
        (self.transitions.len() - 1) as u64
    }

    pub fn add_place_arc_out(&mut self, place_idx: u64, transition_idx: u64) {
        self.place_arcs_out
            .entry(place_idx)
            .or_default()
            .insert(transition_idx);
    }

    pub fn add_trans_arc_out(&mut self, transition_idx: u64, place_idx: u64) {
        self.trans_arcs_out
            .entry(transition_idx)
            .or_default()
            .insert(place_idx);
    }

    pub fn places(&self) -> &[String] {
        &self.places
    }

    pub fn transitions(&self) -> &[TransitionSpec] {
        &self.transitions
    }

    pub fn place_arcs_out(&self, place_idx: u64) -> BTreeSet<u64> {
        self.place_arcs_out
            .get(&place_idx)
            .cloned()
            .unwrap_or_default()
    }

    pub fn trans_arcs_out(&self, transition_idx: u64) -> BTreeSet<u64> {
        self.trans_arcs_out
            .get(&transition_idx)
            .cloned()
            .unwrap_or_default()
    }

    /// Splice `subnet` into this net.
    ///
    /// Every index of the subnet is rebased by this net's current place and
    /// transition counts; the subnet's arcs and the place references inside
    /// its transition kinds are copied with the offsets applied. Then, for
    /// each `{host_place -> subnet_place}` entry in `translation`, a
    /// synthetic [`TransitionKind::Bridge`] transition routes tokens from
    /// the host place into the (rebased) subnet place.
    ///
    /// Returns the place offset so callers can address spliced elements.
    pub fn splice(&mut self, subnet: &NetBuilder, translation: &BTreeMap<u64, u64>) -> u64 {
        let place_offset = self.places.len() as u64;
        let trans_offset = self.transitions.len() as u64;

        self.places.extend(subnet.places.iter().cloned());

        for spec in &subnet.transitions {
            let mut spec = spec.clone();
            spec.kind.rebase_places(place_offset);
            self.transitions.push(spec);
        }

        for (src, dst_set) in &subnet.place_arcs_out {
            for dst in dst_set {
                self.add_place_arc_out(src + place_offset, dst + trans_offset);
            }
        }
        for (src, dst_set) in &subnet.trans_arcs_out {
            for dst in dst_set {
                self.add_trans_arc_out(src + trans_offset, dst + place_offset);
            }
        }

        for (host_place, subnet_place) in translation {
            let bridge = self.add_transition(TransitionSpec::new("bridge", TransitionKind::Bridge));
            self.add_place_arc_out(*host_place, bridge);
            self.add_trans_arc_out(bridge, subnet_place + place_offset);
        }

        place_offset
    }

    /// Persist the assembled structure as a new [`Net`]
    pub async fn store(&self, store: Arc<dyn Store>) -> Result<Net> {
        let net = Net::create(store, &self.name).await?;

        for place_name in &self.places {
            net.add_place(place_name).await?;
        }
        for spec in &self.transitions {
            let transition = net.add_transition(spec.kind.clone()).await?;
            transition.set_name(&spec.name).await?;
        }
        for (src, dst_set) in &self.place_arcs_out {
            for dst in dst_set {
                net.add_place_arc_out(*src, *dst).await?;
            }
        }
        for (src, dst_set) in &self.trans_arcs_out {
            for dst in dst_set {
                net.add_trans_arc_out(*src, *dst).await?;
            }
        }

        Ok(net)
    }
}
