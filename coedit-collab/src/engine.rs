//! Transport-free protocol engine.
//!
//! ```text
//! ClientMessage ──► handle ──► RoomRegistry (room lock held)
//!                                  │  snapshot / insertAck / docDelta
//!                                  ├──► SessionHub (queued under the lock)
//!                                  │  Vec<Envelope>
//!                                  ▼
//!                   dispatch ──► SessionHub (room lock released)
//! ```
//!
//! Document traffic is queued while the room is locked, so every session
//! sees a room's changes in commit order. Queueing never waits on a reader.
//! Presence, membership and error replies are returned for [`dispatch`].
//!
//! A [`Session`] is one connection: a site with its own allocator plus the
//! rooms it joined and the username it joined each one as.
//!
//! [`dispatch`]: CollabEngine::dispatch

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};

use coedit_core::{CoreError, Delta, PositionAllocator, SiteId};

use crate::broadcast::{direct, fan_out, siblings, to_members, Envelope, SessionHub, SessionId};
use crate::config::ServerConfig;
use crate::presence::PresenceState;
use crate::protocol::{ClientMessage, ServerMessage, WireFormat};
use crate::registry::RoomRegistry;
use crate::room::{Room, RoomSnapshot};

/// Per-connection state.
pub struct Session {
    id: SessionId,
    allocator: PositionAllocator,
    /// room → username joined as
    rooms: HashMap<String, String>,
    format: WireFormat,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn site(&self) -> SiteId {
        self.allocator.site()
    }

    /// Encoding used for replies.
    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn set_format(&mut self, format: WireFormat) {
        self.format = format;
    }

    pub fn joined_as(&self, room_id: &str) -> Option<&str> {
        self.rooms.get(room_id).map(String::as_str)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

pub struct CollabEngine {
    registry: RoomRegistry,
    hub: SessionHub,
}

impl CollabEngine {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            registry: RoomRegistry::with_max_members(config.max_members_per_room),
            hub: SessionHub::new(config.session_buffer),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn hub(&self) -> &SessionHub {
        &self.hub
    }

    /// Open a session backed by a fresh site.
    pub async fn open_session(&self) -> (Session, mpsc::Receiver<Arc<ServerMessage>>) {
        self.open_session_with(PositionAllocator::new(SiteId::generate())).await
    }

    pub async fn open_session_with(
        &self,
        allocator: PositionAllocator,
    ) -> (Session, mpsc::Receiver<Arc<ServerMessage>>) {
        let id = SessionId::generate();
        let rx = self.hub.register(id).await;
        log::debug!("Session {id} opened for site {}", allocator.site());
        let session = Session {
            id,
            allocator,
            rooms: HashMap::new(),
            format: WireFormat::default(),
        };
        (session, rx)
    }

    /// Run one client operation. Document traffic is queued before this
    /// returns; the envelopes returned still have to be dispatched.
    pub async fn handle(&self, session: &mut Session, message: ClientMessage) -> Vec<Envelope> {
        if let Err(e) = message.validate() {
            log::warn!("Rejected operation from session {}: {e}", session.id);
            return vec![direct(session.id, ServerMessage::error(e.to_string()))];
        }

        match message {
            ClientMessage::JoinRoom { room_id, username } => {
                self.join(session, room_id, username).await
            }

            ClientMessage::EditInsert { room_id, after_position, grapheme } => {
                let rejected = after_position.clone().map(|after_position| {
                    ServerMessage::InsertRejected {
                        room_id: room_id.clone(),
                        after_position,
                        grapheme: grapheme.clone(),
                    }
                });
                self.edit(session, &room_id, true, rejected, move |room, allocator| {
                    let position = room.document_mut().insert_at(
                        allocator,
                        after_position.as_ref(),
                        grapheme.clone(),
                    )?;
                    Ok(Some(Delta::Insert { position, grapheme }))
                })
                .await
            }

            ClientMessage::EditInsertFront { room_id, grapheme } => {
                self.edit(session, &room_id, true, None, move |room, allocator| {
                    let position = room.document_mut().insert_front(allocator, grapheme.clone())?;
                    Ok(Some(Delta::Insert { position, grapheme }))
                })
                .await
            }

            ClientMessage::EditDelete { room_id, position } => {
                self.edit(session, &room_id, false, None, move |room, _| {
                    room.document_mut().delete_at(&position)?;
                    Ok(Some(Delta::Delete { position }))
                })
                .await
            }

            ClientMessage::RemoteDelta { room_id, delta } => {
                self.edit(session, &room_id, false, None, move |room, allocator| {
                    allocator.observe(delta.position());
                    let applied = room.document_mut().apply_remote_delta(&delta);
                    Ok(applied.changed().then_some(delta))
                })
                .await
            }

            ClientMessage::LeaveRoom { room_id, username } => {
                if session.joined_as(&room_id) != Some(username.as_str()) {
                    return vec![not_joined(session.id, &room_id, &username)];
                }
                session.rooms.remove(&room_id);
                self.leave(session.id, &room_id, &username).await
            }

            ClientMessage::CursorMove { room_id, username, position } => {
                log::trace!("{username} moved cursor in room {room_id}");
                let message = ServerMessage::CursorUpdate {
                    room_id: room_id.clone(),
                    username: username.clone(),
                    position,
                };
                self.presence(session, &room_id, &username, message, |p| p.move_cursor(position))
                    .await
            }

            ClientMessage::Highlight { room_id, username, selected_text, selection_range } => {
                let message = ServerMessage::HighlightUpdate {
                    room_id: room_id.clone(),
                    username: username.clone(),
                    selected_text: selected_text.clone(),
                    selection_range,
                };
                self.presence(session, &room_id, &username, message, move |p| {
                    p.set_highlight(selected_text, selection_range)
                })
                .await
            }

            ClientMessage::HighlightOff { room_id, username } => {
                let message = ServerMessage::HighlightRemoved {
                    room_id: room_id.clone(),
                    username: username.clone(),
                };
                self.presence(session, &room_id, &username, message, |p| {
                    p.clear_highlight();
                })
                .await
            }

            ClientMessage::TypingStart { room_id, username } => {
                self.typing(session, room_id, username, true).await
            }

            ClientMessage::TypingStop { room_id, username } => {
                self.typing(session, room_id, username, false).await
            }

            ClientMessage::Ping => vec![direct(session.id, ServerMessage::Pong)],
        }
    }

    /// Deliver envelopes. Returns the number of messages queued.
    pub async fn dispatch(&self, envelopes: Vec<Envelope>) -> usize {
        self.hub.deliver(envelopes).await
    }

    /// [`handle`](Self::handle) followed by [`dispatch`](Self::dispatch).
    pub async fn process(&self, session: &mut Session, message: ClientMessage) -> usize {
        let envelopes = self.handle(session, message).await;
        self.dispatch(envelopes).await
    }

    /// Tear a session down: leave every room it joined, then unregister it.
    pub async fn disconnect(&self, mut session: Session) {
        let mut envelopes = Vec::new();
        for (room_id, username) in std::mem::take(&mut session.rooms) {
            envelopes.extend(self.leave(session.id, &room_id, &username).await);
        }
        self.hub.unregister(session.id).await;
        self.dispatch(envelopes).await;
        log::debug!("Session {} closed", session.id);
    }

    /// Send a fresh snapshot for every room in which the session missed
    /// document traffic. Returns the number of snapshots queued.
    pub async fn resync(&self, session: &Session) -> usize {
        let mut queued = 0;
        for room_id in self.hub.lagged_rooms(session.id).await {
            let Some(room) = self.registry.lock_existing(&room_id).await else {
                self.hub.clear_lag(session.id, &room_id).await;
                continue;
            };
            if !self.hub.clear_lag(session.id, &room_id).await {
                continue;
            }
            log::info!("Resyncing session {} in room {room_id} at v{}", session.id, room.version());
            let snapshot = snapshot_message(room.snapshot());
            queued += self.hub.deliver(vec![direct(session.id, snapshot)]).await;
        }
        queued
    }

    /// Evict rooms idle for at least `ttl`.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let evicted = self.registry.evict_idle(ttl).await;
        for room_id in &evicted {
            self.hub.detach_room(room_id).await;
        }
        evicted
    }

    async fn join(&self, session: &mut Session, room_id: String, username: String) -> Vec<Envelope> {
        if let Some(existing) = session.joined_as(&room_id) {
            if existing != username {
                let message = format!("Already joined room {room_id} as {existing}");
                return vec![direct(session.id, ServerMessage::error(message))];
            }
        }

        let mut room = self.registry.lock_room(&room_id).await;
        let snapshot = match self.registry.admit(&mut room, &username) {
            Ok(snapshot) => snapshot,
            Err(full) => {
                log::warn!("{full}; rejected {username}");
                return vec![direct(session.id, ServerMessage::error(full.to_string()))];
            }
        };
        self.hub.attach(&room_id, &username, session.id).await;
        self.hub.clear_lag(session.id, &room_id).await;
        session.rooms.insert(room_id.clone(), username.clone());

        // Queued under the lock: every later change of this room follows it.
        let members = snapshot.members.clone();
        let presence = snapshot.presence.clone();
        self.hub
            .deliver(vec![direct(session.id, snapshot_message(snapshot))])
            .await;
        drop(room);

        let mut out = Vec::new();
        for (other, presence) in presence.iter().filter(|(u, _)| *u != username) {
            out.extend(replay_presence(&room_id, other, presence).map(|m| direct(session.id, m)));
        }

        out.extend(fan_out(
            &room_id,
            &members,
            &username,
            ServerMessage::MemberList { room_id: room_id.clone(), users: members.clone() },
        ));
        out
    }

    async fn leave(&self, session: SessionId, room_id: &str, username: &str) -> Vec<Envelope> {
        // Another tab still speaks for this user; membership is unchanged.
        if self.hub.detach(room_id, username, session).await > 0 {
            return Vec::new();
        }

        match self.registry.leave_room(room_id, username).await {
            Some(members) => fan_out(
                room_id,
                &members,
                username,
                ServerMessage::MemberList { room_id: room_id.to_string(), users: members.clone() },
            ),
            None => Vec::new(),
        }
    }

    async fn edit<F>(
        &self,
        session: &mut Session,
        room_id: &str,
        ack: bool,
        rejected: Option<ServerMessage>,
        apply: F,
    ) -> Vec<Envelope>
    where
        F: FnOnce(&mut Room, &mut PositionAllocator) -> Result<Option<Delta>, CoreError>,
    {
        let Some(username) = session.rooms.get(room_id).cloned() else {
            return vec![direct(
                session.id,
                ServerMessage::error(format!("Not joined to room {room_id}")),
            )];
        };

        let Some(mut room) = self.registry.lock_existing(room_id).await else {
            log::debug!("Edit for missing room {room_id} dropped");
            return Vec::new();
        };
        if !room.is_member(&username) {
            let message = format!("Not a member of room {room_id}; rejoin");
            return vec![direct(session.id, ServerMessage::error(message))];
        }

        let delta = match apply(&mut *room, &mut session.allocator) {
            Ok(Some(delta)) => delta,
            Ok(None) => return Vec::new(),
            Err(e) if e.is_not_found() => {
                log::debug!("No-op edit in room {room_id}: {e}");
                return rejected.map(|m| direct(session.id, m)).into_iter().collect();
            }
            Err(e) => return self.fault_room(room, &e).await,
        };
        let version = room.record_change();
        log::debug!("Room {room_id} v{version}: {delta:?} by {username}");

        let mut out = Vec::new();
        if ack {
            if let Delta::Insert { position, grapheme } = &delta {
                out.push(direct(
                    session.id,
                    ServerMessage::InsertAck {
                        room_id: room_id.to_string(),
                        version,
                        position: position.clone(),
                        grapheme: grapheme.clone(),
                    },
                ));
            }
        }
        let message = ServerMessage::doc_delta(room_id, version, delta);
        out.push(siblings(room_id, &username, session.id, message.clone()));
        out.extend(fan_out(room_id, room.members(), &username, message));

        // Queued before the next change of this room can commit.
        self.hub.deliver(out).await;
        Vec::new()
    }

    async fn presence(
        &self,
        session: &Session,
        room_id: &str,
        username: &str,
        message: ServerMessage,
        update: impl FnOnce(&mut PresenceState),
    ) -> Vec<Envelope> {
        if session.joined_as(room_id) != Some(username) {
            return vec![not_joined(session.id, room_id, username)];
        }

        let members = self
            .registry
            .with_existing_room(room_id, |room| {
                update(room.presence_mut(username)?);
                Some(room.members().to_vec())
            })
            .await
            .flatten();

        match members {
            Some(members) => fan_out(room_id, &members, username, message),
            None => Vec::new(),
        }
    }

    async fn typing(
        &self,
        session: &Session,
        room_id: String,
        username: String,
        is_typing: bool,
    ) -> Vec<Envelope> {
        let message = ServerMessage::TypingUpdate {
            room_id: room_id.clone(),
            username: username.clone(),
            is_typing,
        };
        self.presence(session, &room_id, &username, message, |p| {
            p.set_typing(is_typing);
        })
        .await
    }

    /// Discard a room whose ordering guarantee broke and tell every member
    /// to rejoin.
    async fn fault_room(&self, mut room: OwnedMutexGuard<Room>, error: &CoreError) -> Vec<Envelope> {
        let room_id = room.id().to_string();
        log::error!("Room {room_id} faulted: {error}");
        room.retire();
        let fault = ServerMessage::RoomFault {
            room_id: room_id.clone(),
            reason: error.to_string(),
        };
        self.hub.deliver(to_members(&room_id, room.members(), fault)).await;
        drop(room);

        self.registry.discard_room(&room_id).await;
        self.hub.detach_room(&room_id).await;
        Vec::new()
    }
}

fn snapshot_message(snapshot: RoomSnapshot) -> ServerMessage {
    ServerMessage::Snapshot {
        room_id: snapshot.room_id,
        version: snapshot.version,
        document: snapshot.document,
        entries: snapshot.entries,
        members: snapshot.members,
    }
}

fn not_joined(session: SessionId, room_id: &str, username: &str) -> Envelope {
    direct(
        session,
        ServerMessage::error(format!("Not joined to room {room_id} as {username}")),
    )
}

/// Presence messages that bring a newcomer up to date on one member.
fn replay_presence<'a>(
    room_id: &'a str,
    username: &'a str,
    presence: &'a PresenceState,
) -> impl Iterator<Item = ServerMessage> + 'a {
    let cursor = presence.cursor.map(|position| ServerMessage::CursorUpdate {
        room_id: room_id.to_string(),
        username: username.to_string(),
        position,
    });
    let highlight = presence.highlight.as_ref().map(|h| ServerMessage::HighlightUpdate {
        room_id: room_id.to_string(),
        username: username.to_string(),
        selected_text: h.selected_text.clone(),
        selection_range: h.range,
    });
    let typing = presence.typing.then(|| ServerMessage::TypingUpdate {
        room_id: room_id.to_string(),
        username: username.to_string(),
        is_typing: true,
    });
    cursor.into_iter().chain(highlight).chain(typing)
}
