//! Globally comparable character positions.
//!
//! A [`Position`] is a path through an implicit tree. Each step is a
//! [`Segment`]: a side (`Left`/`Right` of its parent) and a [`Stamp`] that
//! uniquely names the allocation that created it.
//!
//! ```text
//!                 R(h)                 in-order walk:
//!               /      \
//!          L(x)          R(e)          x  h  y  e
//!                       /
//!                   L(y)
//! ```
//!
//! Stamps are compared as fixed-width integers `(clock, site, counter)`, so
//! the order never depends on how the values would sort as text.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

/// Identifier of one editing site (a connected session or client replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SiteId(pub Uuid);

impl SiteId {
    /// A fresh random site identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic site identifier (tests, tooling).
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// The unique name of one allocation: `(clock, site, counter)`.
///
/// Field order matters: the derived `Ord` compares clock first, then site,
/// then counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub site: SiteId,
    pub counter: u64,
}

impl Stamp {
    pub fn new(clock: u64, site: SiteId, counter: u64) -> Self {
        Self { clock, site, counter }
    }
}

/// Which side of its parent a segment hangs on. `Left < Right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// One step of a position path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub side: Side,
    pub stamp: Stamp,
}

impl Segment {
    pub fn new(side: Side, stamp: Stamp) -> Self {
        Self { side, stamp }
    }

    fn cmp_sibling(&self, other: &Segment) -> Ordering {
        match self.side.cmp(&other.side) {
            Ordering::Equal => self.stamp.cmp(&other.stamp),
            unequal => unequal,
        }
    }
}

/// Rejected when decoding a position with an empty path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPosition;

impl std::fmt::Display for InvalidPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "position path must not be empty")
    }
}

impl std::error::Error for InvalidPosition {}

/// An immutable, totally ordered character position.
///
/// Invariant: the path is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Segment>", into = "Vec<Segment>")]
pub struct Position {
    path: Vec<Segment>,
}

impl Position {
    /// A top-level position.
    pub fn root(side: Side, stamp: Stamp) -> Self {
        Self {
            path: vec![Segment::new(side, stamp)],
        }
    }

    /// A position nested under `self` on the given side.
    pub fn child(&self, side: Side, stamp: Stamp) -> Self {
        let mut path = Vec::with_capacity(self.path.len() + 1);
        path.extend_from_slice(&self.path);
        path.push(Segment::new(side, stamp));
        Self { path }
    }

    /// A position sharing `self`'s parent and side, ordered right after
    /// `self` and its subtree. Only possible when `stamp` is greater than
    /// the last stamp of `self`.
    pub fn sibling_after(&self, stamp: Stamp) -> Option<Self> {
        let last = self.last();
        if stamp <= last.stamp {
            return None;
        }
        let mut path = self.path.clone();
        let side = last.side;
        if let Some(tail) = path.last_mut() {
            *tail = Segment::new(side, stamp);
        }
        Some(Self { path })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.path
    }

    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// The segment that created this position.
    pub fn last(&self) -> &Segment {
        // Non-empty by construction and by `TryFrom`.
        &self.path[self.path.len() - 1]
    }

    /// The stamp of the allocation that created this position.
    pub fn stamp(&self) -> Stamp {
        self.last().stamp
    }

    /// Whether `other` lies in the subtree rooted at `self`.
    pub fn is_ancestor_of(&self, other: &Position) -> bool {
        other.path.len() > self.path.len() && other.path.starts_with(&self.path)
    }

    /// Highest clock value anywhere on the path.
    pub fn max_clock(&self) -> u64 {
        self.path.iter().map(|s| s.stamp.clock).max().unwrap_or(0)
    }
}

impl TryFrom<Vec<Segment>> for Position {
    type Error = InvalidPosition;

    fn try_from(path: Vec<Segment>) -> Result<Self, Self::Error> {
        if path.is_empty() {
            return Err(InvalidPosition);
        }
        Ok(Self { path })
    }
}

impl From<Position> for Vec<Segment> {
    fn from(position: Position) -> Self {
        position.path
    }
}

impl Ord for Position {
    /// In-order walk of the implied tree: left subtrees, node, right subtrees;
    /// siblings on the same side ordered by stamp.
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.path.iter().zip(&other.path) {
            if a != b {
                return a.cmp_sibling(b);
            }
        }
        match self.path.len().cmp(&other.path.len()) {
            Ordering::Equal => Ordering::Equal,
            // `other` is inside our subtree.
            Ordering::Less => match other.path[self.path.len()].side {
                Side::Left => Ordering::Greater,
                Side::Right => Ordering::Less,
            },
            Ordering::Greater => match self.path[other.path.len()].side {
                Side::Left => Ordering::Less,
                Side::Right => Ordering::Greater,
            },
        }
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, seg) in self.path.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            let side = match seg.side {
                Side::Left => 'L',
                Side::Right => 'R',
            };
            write!(
                f,
                "{side}{:016x}.{}.{:x}",
                seg.stamp.clock, seg.stamp.site, seg.stamp.counter
            )?;
        }
        Ok(())
    }
}
