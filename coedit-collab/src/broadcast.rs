//! Fan-out of room notifications to the sessions of other members.
//!
//! Two halves:
//! - [`fan_out`] / [`direct`]: pure translation of one notification into
//!   envelopes, excluding the originating user;
//! - [`SessionHub`]: delivery of envelopes into per-session bounded queues.
//!
//! Delivery never waits: a full or closed queue drops the message and bumps
//! `messages_dropped`, so one stalled reader cannot hold up anyone else.
//! Dropped presence is simply lost. Dropped document traffic marks the
//! session *lagged* in that room: further document messages for it are
//! skipped until the engine resyncs the session with a fresh snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Identity of one connected session (one socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an envelope goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every session attached as `username` in `room_id`.
    Member { room_id: String, username: String },
    /// Sessions attached as `username` in `room_id`, except `except`.
    Siblings { room_id: String, username: String, except: SessionId },
    /// One specific session.
    Session(SessionId),
}

/// A notification addressed to one recipient.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub target: Target,
    pub message: Arc<ServerMessage>,
}

impl Envelope {
    pub fn recipient(&self) -> Option<&str> {
        match &self.target {
            Target::Member { username, .. } | Target::Siblings { username, .. } => Some(username),
            Target::Session(_) => None,
        }
    }
}

/// One envelope per member of `members` other than `origin`.
pub fn fan_out(
    room_id: &str,
    members: &[String],
    origin: &str,
    message: ServerMessage,
) -> Vec<Envelope> {
    let message = Arc::new(message);
    members
        .iter()
        .filter(|m| m.as_str() != origin)
        .map(|m| Envelope {
            target: Target::Member {
                room_id: room_id.to_string(),
                username: m.clone(),
            },
            message: message.clone(),
        })
        .collect()
}

/// One envelope per member, sender included.
pub fn to_members(room_id: &str, members: &[String], message: ServerMessage) -> Vec<Envelope> {
    let message = Arc::new(message);
    members
        .iter()
        .map(|m| Envelope {
            target: Target::Member {
                room_id: room_id.to_string(),
                username: m.clone(),
            },
            message: message.clone(),
        })
        .collect()
}

/// The sender's other sessions in the same room (a user editing from two
/// tabs sees their own changes in both).
pub fn siblings(room_id: &str, username: &str, origin: SessionId, message: ServerMessage) -> Envelope {
    Envelope {
        target: Target::Siblings {
            room_id: room_id.to_string(),
            username: username.to_string(),
            except: origin,
        },
        message: Arc::new(message),
    }
}

/// An envelope for exactly one session.
pub fn direct(session: SessionId, message: ServerMessage) -> Envelope {
    Envelope {
        target: Target::Session(session),
        message: Arc::new(message),
    }
}

/// Delivery statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Atomic counters, updated without taking the hub lock.
struct AtomicHubStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<SessionId, mpsc::Sender<Arc<ServerMessage>>>,
    /// (room, username) → sessions speaking for that member.
    members: HashMap<(String, String), Vec<SessionId>>,
    /// session → rooms whose document traffic overflowed its queue.
    lagged: HashMap<SessionId, HashSet<String>>,
}

impl HubState {
    fn recipients(&self, target: &Target) -> Vec<SessionId> {
        match target {
            Target::Session(session) => vec![*session],
            Target::Member { room_id, username } => self
                .members
                .get(&(room_id.clone(), username.clone()))
                .cloned()
                .unwrap_or_default(),
            Target::Siblings { room_id, username, except } => self
                .members
                .get(&(room_id.clone(), username.clone()))
                .map(|sessions| sessions.iter().copied().filter(|s| s != except).collect())
                .unwrap_or_default(),
        }
    }

    fn is_lagged(&self, session: SessionId, room_id: &str) -> bool {
        self.lagged.get(&session).is_some_and(|rooms| rooms.contains(room_id))
    }

    fn clear_lag(&mut self, session: SessionId, room_id: &str) -> bool {
        let Some(rooms) = self.lagged.get_mut(&session) else {
            return false;
        };
        let removed = rooms.remove(room_id);
        if rooms.is_empty() {
            self.lagged.remove(&session);
        }
        removed
    }
}

/// Result of pushing one message into one queue.
enum Push {
    Queued,
    Dropped,
    /// Document traffic for this room was lost.
    Overflowed(String),
}

/// Routes envelopes to session queues.
pub struct SessionHub {
    state: RwLock<HubState>,
    /// Queue capacity per session.
    capacity: usize,
    stats: AtomicHubStats,
}

impl SessionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            capacity: capacity.max(1),
            stats: AtomicHubStats::new(),
        }
    }

    /// Register a session and return the receiving end of its queue.
    pub async fn register(&self, session: SessionId) -> mpsc::Receiver<Arc<ServerMessage>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.state.write().await.sessions.insert(session, tx);
        rx
    }

    /// Forget a session and every membership it was attached to.
    pub async fn unregister(&self, session: SessionId) {
        let mut state = self.state.write().await;
        state.sessions.remove(&session);
        state.lagged.remove(&session);
        state.members.retain(|_, sessions| {
            sessions.retain(|s| *s != session);
            !sessions.is_empty()
        });
    }

    /// Route `username`'s notifications in `room_id` to `session`.
    pub async fn attach(&self, room_id: &str, username: &str, session: SessionId) {
        let mut state = self.state.write().await;
        let sessions = state
            .members
            .entry((room_id.to_string(), username.to_string()))
            .or_default();
        if !sessions.contains(&session) {
            sessions.push(session);
        }
    }

    /// Stop routing; returns how many sessions still speak for the member.
    pub async fn detach(&self, room_id: &str, username: &str, session: SessionId) -> usize {
        let mut state = self.state.write().await;
        let key = (room_id.to_string(), username.to_string());
        state.clear_lag(session, room_id);
        let Some(sessions) = state.members.get_mut(&key) else {
            return 0;
        };
        sessions.retain(|s| *s != session);
        let remaining = sessions.len();
        if remaining == 0 {
            state.members.remove(&key);
        }
        remaining
    }

    /// Drop every routing entry of a room.
    pub async fn detach_room(&self, room_id: &str) {
        let mut state = self.state.write().await;
        state.members.retain(|(room, _), _| room != room_id);
        state.lagged.retain(|_, rooms| {
            rooms.remove(room_id);
            !rooms.is_empty()
        });
    }

    /// Queue each envelope for its recipients. Returns messages queued.
    pub async fn deliver(&self, envelopes: Vec<Envelope>) -> usize {
        if envelopes.is_empty() {
            return 0;
        }
        let mut queued = 0;
        let mut overflowed = Vec::new();
        {
            let state = self.state.read().await;
            for envelope in &envelopes {
                for session in state.recipients(&envelope.target) {
                    match self.push(&state, session, &envelope.message) {
                        Push::Queued => queued += 1,
                        Push::Dropped => {}
                        Push::Overflowed(room_id) => overflowed.push((session, room_id)),
                    }
                }
            }
        }

        if !overflowed.is_empty() {
            let mut state = self.state.write().await;
            for (session, room_id) in overflowed {
                if state.sessions.contains_key(&session) {
                    log::warn!("Session {session} fell behind in room {room_id}; resync pending");
                    state.lagged.entry(session).or_default().insert(room_id);
                }
            }
        }
        queued
    }

    fn push(&self, state: &HubState, session: SessionId, message: &Arc<ServerMessage>) -> Push {
        let Some(tx) = state.sessions.get(&session) else {
            return Push::Dropped;
        };
        let document_room = message.document_room();
        if document_room.is_some_and(|room_id| state.is_lagged(session, room_id)) {
            // Superseded by the resync snapshot.
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return Push::Dropped;
        }

        match tx.try_send(message.clone()) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                Push::Queued
            }
            Err(TrySendError::Full(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                match document_room {
                    Some(room_id) => Push::Overflowed(room_id.to_string()),
                    None => {
                        log::warn!("Session {session} queue full, dropping message");
                        Push::Dropped
                    }
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                Push::Dropped
            }
        }
    }

    /// Whether the session missed document traffic in any room.
    pub async fn is_lagged(&self, session: SessionId) -> bool {
        self.state.read().await.lagged.contains_key(&session)
    }

    /// Rooms the session has to be resynced in.
    pub async fn lagged_rooms(&self, session: SessionId) -> Vec<String> {
        let state = self.state.read().await;
        let mut rooms: Vec<String> = state
            .lagged
            .get(&session)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Resume document delivery for the session in `room_id`. Returns
    /// whether it was lagged there.
    pub async fn clear_lag(&self, session: SessionId, room_id: &str) -> bool {
        self.state.write().await.clear_lag(session, room_id)
    }

    /// Sessions currently attached as `username` in `room_id`.
    pub async fn sessions_for(&self, room_id: &str, username: &str) -> usize {
        self.state
            .read()
            .await
            .members
            .get(&(room_id.to_string(), username.to_string()))
            .map_or(0, Vec::len)
    }

    pub async fn session_count(&self) -> usize {
        self.state.read().await.sessions.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }
}
