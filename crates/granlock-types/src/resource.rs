//! Hierarchical resource names.
//!
//! A [`ResourceName`] identifies one node in the resource tree a host
//! exposes to the lock manager (conventionally `database` ⊃ table ⊃ page).
//! Names are immutable segment paths with value equality; the total order
//! exists so that sets of names can be processed deterministically.

use std::fmt;

/// Immutable identifier of a node in the resource tree.
///
/// Every non-root name has exactly one parent, obtained by dropping the
/// last segment. The conventional root is [`ResourceName::database`].
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ResourceName {
    segments: Vec<String>,
}

impl ResourceName {
    /// A single-segment root name.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            segments: vec![name.into()],
        }
    }

    /// The conventional root of a storage engine's resource tree.
    #[must_use]
    pub fn database() -> Self {
        Self::root("database")
    }

    /// The name of this node's child `segment`.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// The parent name, or `None` for a root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Whether this name has no parent.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    /// The last segment.
    #[must_use]
    pub fn leaf(&self) -> &str {
        self.segments
            .last()
            .expect("a ResourceName always has at least one segment")
    }

    /// Number of segments; a root has depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Whether `self` is a *strict* descendant of `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        self.segments.len() > ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }

    /// The path segments, root first.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}
