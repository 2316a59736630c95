//! The ordered character document of one room.
//!
//! Entries are kept in a `BTreeMap` keyed by [`Position`]; the rendered text
//! is always exactly the graphemes in key order. Deletes remove the entry
//! outright, there are no tombstones.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::allocator::PositionAllocator;
use crate::error::{CoreError, NotFound};
use crate::position::Position;

/// One character of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharEntry {
    pub position: Position,
    pub grapheme: String,
}

/// A change to a document, exchanged between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    Insert { position: Position, grapheme: String },
    Delete { position: Position },
}

impl Delta {
    pub fn position(&self) -> &Position {
        match self {
            Delta::Insert { position, .. } => position,
            Delta::Delete { position } => position,
        }
    }
}

/// Outcome of applying a remote delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Deleted,
    /// Already applied (or already deleted); the document is unchanged.
    Duplicate,
}

impl Applied {
    pub fn changed(&self) -> bool {
        !matches!(self, Applied::Duplicate)
    }
}

/// Ordered `Position → grapheme` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceDocument {
    entries: BTreeMap<Position, String>,
}

impl SequenceDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a replica from a snapshot's entries.
    pub fn from_entries(entries: impl IntoIterator<Item = CharEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|e| (e.position, e.grapheme))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, position: &Position) -> bool {
        self.entries.contains_key(position)
    }

    pub fn get(&self, position: &Position) -> Option<&str> {
        self.entries.get(position).map(String::as_str)
    }

    pub fn first(&self) -> Option<&Position> {
        self.entries.keys().next()
    }

    pub fn last(&self) -> Option<&Position> {
        self.entries.keys().next_back()
    }

    /// Position of the `index`-th visible character.
    pub fn position_at(&self, index: usize) -> Option<&Position> {
        self.entries.keys().nth(index)
    }

    /// Visible index of a position. O(n).
    pub fn index_of(&self, position: &Position) -> Option<usize> {
        if !self.contains(position) {
            return None;
        }
        Some(self.entries.range(..position).count())
    }

    /// Entries in document order.
    pub fn entries(&self) -> impl Iterator<Item = (&Position, &str)> {
        self.entries.iter().map(|(p, g)| (p, g.as_str()))
    }

    pub fn to_entries(&self) -> Vec<CharEntry> {
        self.entries
            .iter()
            .map(|(position, grapheme)| CharEntry {
                position: position.clone(),
                grapheme: grapheme.clone(),
            })
            .collect()
    }

    /// Insert `grapheme` right after `after`, or at the end when `after` is
    /// `None`. Returns the freshly allocated position.
    pub fn insert_at(
        &mut self,
        allocator: &mut PositionAllocator,
        after: Option<&Position>,
        grapheme: impl Into<String>,
    ) -> Result<Position, CoreError> {
        let (prev, next) = match after {
            Some(anchor) => {
                if !self.contains(anchor) {
                    return Err(NotFound::Anchor(anchor.clone()).into());
                }
                (Some(anchor.clone()), self.successor(anchor).cloned())
            }
            None => (self.last().cloned(), None),
        };
        self.insert_between(allocator, prev, next, grapheme.into())
    }

    /// Insert `grapheme` before every existing character.
    pub fn insert_front(
        &mut self,
        allocator: &mut PositionAllocator,
        grapheme: impl Into<String>,
    ) -> Result<Position, CoreError> {
        let next = self.first().cloned();
        self.insert_between(allocator, None, next, grapheme.into())
    }

    fn insert_between(
        &mut self,
        allocator: &mut PositionAllocator,
        prev: Option<Position>,
        next: Option<Position>,
        grapheme: String,
    ) -> Result<Position, CoreError> {
        let position = allocator.between(prev.as_ref(), next.as_ref())?;

        let after_prev = prev.as_ref().map_or(true, |p| *p < position);
        let before_next = next.as_ref().map_or(true, |n| position < *n);
        if !(after_prev && before_next) {
            return Err(CoreError::InvariantViolation(format!(
                "allocated {position} outside ({}, {})",
                prev.map_or_else(|| "start".to_string(), |p| p.to_string()),
                next.map_or_else(|| "end".to_string(), |n| n.to_string()),
            )));
        }
        if self.entries.contains_key(&position) {
            return Err(CoreError::InvariantViolation(format!(
                "allocated {position} already present"
            )));
        }

        self.entries.insert(position.clone(), grapheme);
        Ok(position)
    }

    /// Remove the character at `position`, returning its grapheme.
    pub fn delete_at(&mut self, position: &Position) -> Result<String, CoreError> {
        self.entries
            .remove(position)
            .ok_or_else(|| NotFound::Position(position.clone()).into())
    }

    /// Apply a delta produced by another replica. Idempotent: delivering the
    /// same delta twice leaves the document as if it arrived once.
    pub fn apply_remote_delta(&mut self, delta: &Delta) -> Applied {
        match delta {
            Delta::Insert { position, grapheme } => match self.entries.get(position) {
                Some(existing) => {
                    if existing != grapheme {
                        log::warn!(
                            "Ignoring insert at {position}: holds {existing:?}, delta carries {grapheme:?}"
                        );
                    }
                    Applied::Duplicate
                }
                None => {
                    self.entries.insert(position.clone(), grapheme.clone());
                    Applied::Inserted
                }
            },
            Delta::Delete { position } => match self.entries.remove(position) {
                Some(_) => Applied::Deleted,
                None => Applied::Duplicate,
            },
        }
    }

    /// The document text.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.entries.len());
        for grapheme in self.entries.values() {
            out.push_str(grapheme);
        }
        out
    }

    fn successor(&self, position: &Position) -> Option<&Position> {
        self.entries
            .range((Bound::Excluded(position), Bound::Unbounded))
            .next()
            .map(|(p, _)| p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::FixedClock;
    use crate::position::SiteId;

    fn alloc(site: u128) -> PositionAllocator {
        PositionAllocator::with_clock(SiteId::from_u128(site), FixedClock(100))
    }

    fn type_text(doc: &mut SequenceDocument, a: &mut PositionAllocator, text: &str) -> Vec<Position> {
        text.chars()
            .map(|c| doc.insert_at(a, None, c.to_string()).unwrap())
            .collect()
    }

    #[test]
    fn test_append_hello() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        type_text(&mut doc, &mut a, "hello");
        assert_eq!(doc.render(), "hello");
        assert_eq!(doc.len(), 5);
    }

    #[test]
    fn test_insert_after_first() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        let positions = type_text(&mut doc, &mut a, "hello");

        let mut b = alloc(2);
        doc.insert_at(&mut b, Some(&positions[0]), "X").unwrap();
        assert_eq!(doc.render(), "hXello");
    }

    #[test]
    fn test_insert_front() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        type_text(&mut doc, &mut a, "ello");
        doc.insert_front(&mut a, "h").unwrap();
        assert_eq!(doc.render(), "hello");

        let mut empty = SequenceDocument::new();
        empty.insert_front(&mut a, "z").unwrap();
        assert_eq!(empty.render(), "z");
    }

    #[test]
    fn test_insert_in_middle_repeatedly() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        let positions = type_text(&mut doc, &mut a, "ad");

        let b = doc.insert_at(&mut a, Some(&positions[0]), "b").unwrap();
        doc.insert_at(&mut a, Some(&b), "c").unwrap();
        assert_eq!(doc.render(), "abcd");
    }

    #[test]
    fn test_insert_after_missing_anchor() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        let positions = type_text(&mut doc, &mut a, "ab");
        doc.delete_at(&positions[0]).unwrap();

        let err = doc.insert_at(&mut a, Some(&positions[0]), "x").unwrap_err();
        assert_eq!(err, CoreError::NotFound(NotFound::Anchor(positions[0].clone())));
        assert_eq!(doc.render(), "b");
    }

    #[test]
    fn test_delete_and_delete_again() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        let positions = type_text(&mut doc, &mut a, "abc");

        assert_eq!(doc.delete_at(&positions[1]).unwrap(), "b");
        assert_eq!(doc.render(), "ac");

        let err = doc.delete_at(&positions[1]).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(doc.render(), "ac");
    }

    #[test]
    fn test_remote_insert_is_idempotent() {
        let mut source = SequenceDocument::new();
        let mut a = alloc(1);
        let p = source.insert_at(&mut a, None, "q").unwrap();

        let mut replica = SequenceDocument::new();
        let delta = Delta::Insert { position: p, grapheme: "q".into() };
        assert_eq!(replica.apply_remote_delta(&delta), Applied::Inserted);
        assert_eq!(replica.apply_remote_delta(&delta), Applied::Duplicate);
        assert_eq!(replica.render(), "q");
        assert_eq!(replica, source);
    }

    #[test]
    fn test_remote_delete_is_idempotent() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        let positions = type_text(&mut doc, &mut a, "xy");

        let delta = Delta::Delete { position: positions[0].clone() };
        assert_eq!(doc.apply_remote_delta(&delta), Applied::Deleted);
        assert_eq!(doc.apply_remote_delta(&delta), Applied::Duplicate);
        assert_eq!(doc.render(), "y");
    }

    #[test]
    fn test_conflicting_insert_keeps_first() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        let p = doc.insert_at(&mut a, None, "a").unwrap();

        let delta = Delta::Insert { position: p, grapheme: "z".into() };
        assert_eq!(doc.apply_remote_delta(&delta), Applied::Duplicate);
        assert_eq!(doc.render(), "a");
    }

    #[test]
    fn test_index_lookup() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        let positions = type_text(&mut doc, &mut a, "abc");

        assert_eq!(doc.index_of(&positions[2]), Some(2));
        assert_eq!(doc.position_at(1), Some(&positions[1]));
        assert_eq!(doc.position_at(3), None);
        assert_eq!(doc.first(), Some(&positions[0]));
        assert_eq!(doc.last(), Some(&positions[2]));

        doc.delete_at(&positions[0]).unwrap();
        assert_eq!(doc.index_of(&positions[0]), None);
        assert_eq!(doc.index_of(&positions[2]), Some(1));
    }

    #[test]
    fn test_multi_byte_graphemes() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        doc.insert_at(&mut a, None, "é").unwrap();
        doc.insert_at(&mut a, None, "👍").unwrap();
        assert_eq!(doc.render(), "é👍");
    }

    #[test]
    fn test_from_entries_roundtrip() {
        let mut doc = SequenceDocument::new();
        let mut a = alloc(1);
        type_text(&mut doc, &mut a, "snapshot");

        let replica = SequenceDocument::from_entries(doc.to_entries());
        assert_eq!(replica, doc);
        assert_eq!(replica.render(), "snapshot");
    }

    #[test]
    fn test_delta_position() {
        let mut a = alloc(1);
        let p = a.between(None, None).unwrap();
        assert_eq!(Delta::Delete { position: p.clone() }.position(), &p);
        assert!(Applied::Inserted.changed());
        assert!(!Applied::Duplicate.changed());
    }
}
