//! Scope paths — positional addresses into forEach iteration

use serde::{Deserialize, Serialize};
use std::fmt;

use super::CheckId;

/// One segment of a [`ScopePath`]: "inside item `index` of forEach parent `check`"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeSegment {
    /// The forEach parent check id
    pub check: CheckId,
    /// Item index within that parent's output collection
    pub index: usize,
}

/// An ordered list of [`ScopeSegment`]s. The empty path is the root scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopePath(pub Vec<ScopeSegment>);

impl ScopePath {
    /// The root scope (outside any forEach)
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// True if this is the root scope
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Build a child scope one level inside `check`'s `index`-th item
    pub fn child(&self, check: CheckId, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(ScopeSegment { check, index });
        Self(segments)
    }

    /// True if `other` is a strict prefix of `self`
    pub fn has_strict_prefix(&self, other: &ScopePath) -> bool {
        other.0.len() < self.0.len() && self.0[..other.0.len()] == other.0[..]
    }

    /// True if `other` is a prefix of `self` (including equality)
    pub fn has_prefix(&self, other: &ScopePath) -> bool {
        other.0.len() <= self.0.len() && self.0[..other.0.len()] == other.0[..]
    }

    /// Length of the path, in segments
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for ScopePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for (i, seg) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}[{}]", seg.check, seg.index)?;
        }
        Ok(())
    }
}
