//! A single editing room: document, members and their presence.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use coedit_core::{CharEntry, SequenceDocument};

use crate::presence::PresenceState;

/// Room lifecycle. `Empty → Active` on the first join; never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Empty,
    Active,
}

/// What a joining client needs to bootstrap its view.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub version: u64,
    pub document: String,
    pub entries: Vec<CharEntry>,
    pub members: Vec<String>,
    /// Members with something to show (cursor, highlight, typing), in
    /// join order.
    pub presence: Vec<(String, PresenceState)>,
}

#[derive(Debug)]
pub struct Room {
    id: String,
    document: SequenceDocument,
    /// Join order, no duplicates.
    members: Vec<String>,
    presence: HashMap<String, PresenceState>,
    state: RoomState,
    /// Bumped on every document change.
    version: u64,
    /// Set while the room has no members.
    idle_since: Option<Instant>,
    /// Removed from the registry; holders of a stale handle must look again.
    retired: bool,
}

impl Room {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: SequenceDocument::new(),
            members: Vec::new(),
            presence: HashMap::new(),
            state: RoomState::Empty,
            version: 0,
            idle_since: Some(Instant::now()),
            retired: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn document(&self) -> &SequenceDocument {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut SequenceDocument {
        &mut self.document
    }

    /// Record a document change and return the new version.
    pub fn record_change(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn is_member(&self, username: &str) -> bool {
        self.members.iter().any(|m| m == username)
    }

    /// Add a member. Returns `false` if already present.
    pub fn join(&mut self, username: &str) -> bool {
        self.state = RoomState::Active;
        self.idle_since = None;
        if self.is_member(username) {
            return false;
        }
        self.members.push(username.to_string());
        self.presence.insert(username.to_string(), PresenceState::default());
        true
    }

    /// Remove a member and its presence. The document stays.
    pub fn leave(&mut self, username: &str) -> bool {
        let Some(index) = self.members.iter().position(|m| m == username) else {
            return false;
        };
        self.members.remove(index);
        self.presence.remove(username);
        if self.members.is_empty() {
            self.idle_since = Some(Instant::now());
        }
        true
    }

    pub fn presence(&self, username: &str) -> Option<&PresenceState> {
        self.presence.get(username)
    }

    /// Presence slot of a current member.
    pub fn presence_mut(&mut self, username: &str) -> Option<&mut PresenceState> {
        self.presence.get_mut(username)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.id.clone(),
            version: self.version,
            document: self.document.render(),
            entries: self.document.to_entries(),
            members: self.members.clone(),
            presence: self
                .members
                .iter()
                .filter_map(|m| self.presence.get(m).map(|p| (m, p)))
                .filter(|(_, p)| !p.is_idle())
                .map(|(m, p)| (m.clone(), p.clone()))
                .collect(),
        }
    }

    /// How long the room has been without members.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.idle_since.map(|since| now.saturating_duration_since(since))
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }
}
