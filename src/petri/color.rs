// Colors and color groups - concurrent workflow instances and nested scopes

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A contiguous range of colors `[begin, end)` sharing a parent.
///
/// Color groups form a tree: a group spawned inside a parallel scope records
/// the parent color (the instance that spawned it) and the parent group.
/// Group indices and color ranges are allocated from the net's monotonic
/// counters and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorGroup {
    pub idx: u64,
    pub parent_color: Option<u64>,
    pub parent_color_group: Option<u64>,
    pub begin: u64,
    pub end: u64,
}

impl ColorGroup {
    pub fn size(&self) -> u64 {
        self.end - self.begin
    }

    pub fn colors(&self) -> Range<u64> {
        self.begin..self.end
    }

    pub fn contains(&self, color: u64) -> bool {
        self.begin <= color && color < self.end
    }
}

/// The (color, group) pair that identifies one firing of a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorDescriptor {
    pub color: u64,
    pub group: ColorGroup,
}

impl ColorDescriptor {
    pub fn new(color: u64, group: ColorGroup) -> Self {
        Self { color, group }
    }
}
