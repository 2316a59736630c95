//! Concurrency-safe room table with per-room mutual exclusion.
//!
//! The outer `RwLock` only guards the name → handle map. Every mutation of a
//! room happens under that room's own `Mutex`, so edits in different rooms
//! never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::room::{Room, RoomSnapshot};

type RoomHandle = Arc<Mutex<Room>>;

/// A join refused because the room is at capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomFull {
    pub room_id: String,
    pub capacity: usize,
}

impl std::fmt::Display for RoomFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Room {} is full ({} members)", self.room_id, self.capacity)
    }
}

impl std::error::Error for RoomFull {}

/// All live rooms, keyed by case-sensitive room name.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, RoomHandle>>,
    /// Maximum members per room
    max_members: usize,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    /// Registry without a member limit.
    pub fn new() -> Self {
        Self::with_max_members(usize::MAX)
    }

    pub fn with_max_members(max_members: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_members,
        }
    }

    /// Get or create the handle for `room_id`.
    async fn handle(&self, room_id: &str) -> RoomHandle {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(Mutex::new(Room::new(room_id)));
        rooms.insert(room_id.to_string(), room.clone());
        log::info!("Room {room_id} created");
        room
    }

    async fn existing(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Drop `handle` from the table if it is still the one registered.
    async fn forget(&self, room_id: &str, handle: &RoomHandle) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|h| Arc::ptr_eq(h, handle)) {
            rooms.remove(room_id);
        }
    }

    /// Lock the room, creating it if needed. The guard is the room's
    /// critical section.
    pub async fn lock_room(&self, room_id: &str) -> OwnedMutexGuard<Room> {
        loop {
            let handle = self.handle(room_id).await;
            let room = handle.clone().lock_owned().await;
            if !room.is_retired() {
                return room;
            }
            // Discarded or evicted between lookup and lock.
            drop(room);
            self.forget(room_id, &handle).await;
        }
    }

    /// Lock an existing room; `None` if there is none.
    pub async fn lock_existing(&self, room_id: &str) -> Option<OwnedMutexGuard<Room>> {
        let handle = self.existing(room_id).await?;
        let room = handle.lock_owned().await;
        (!room.is_retired()).then_some(room)
    }

    /// Run `f` inside the room's critical section, creating the room if needed.
    pub async fn with_room<R>(&self, room_id: &str, f: impl FnOnce(&mut Room) -> R) -> R {
        let mut room = self.lock_room(room_id).await;
        f(&mut room)
    }

    /// Like [`with_room`](Self::with_room) but never creates; `None` if the
    /// room does not exist.
    pub async fn with_existing_room<R>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut Room) -> R,
    ) -> Option<R> {
        let mut room = self.lock_existing(room_id).await?;
        Some(f(&mut room))
    }

    /// Add `username` to a locked room (idempotent) and return the bootstrap
    /// view.
    pub fn admit(&self, room: &mut Room, username: &str) -> Result<RoomSnapshot, RoomFull> {
        if !room.is_member(username) && room.members().len() >= self.max_members {
            return Err(RoomFull {
                room_id: room.id().to_string(),
                capacity: self.max_members,
            });
        }
        if room.join(username) {
            log::info!("{username} joined room {}", room.id());
        }
        Ok(room.snapshot())
    }

    /// Add `username` to the room (idempotent) and return the bootstrap view.
    pub async fn join_room(&self, room_id: &str, username: &str) -> Result<RoomSnapshot, RoomFull> {
        let mut room = self.lock_room(room_id).await;
        self.admit(&mut room, username)
    }

    /// Remove `username` and its presence. Returns the remaining members, or
    /// `None` when there was nothing to remove. An emptied room keeps its
    /// document.
    pub async fn leave_room(&self, room_id: &str, username: &str) -> Option<Vec<String>> {
        self.with_existing_room(room_id, |room| {
            if room.leave(username) {
                log::info!("{username} left room {room_id}");
                Some(room.members().to_vec())
            } else {
                None
            }
        })
        .await
        .flatten()
    }

    /// Drop a room and its document (room-level fault).
    pub async fn discard_room(&self, room_id: &str) -> bool {
        let handle = self.rooms.write().await.remove(room_id);
        let Some(handle) = handle else {
            return false;
        };
        // Lookups proceed while a busy room finishes its critical section.
        handle.lock().await.retire();
        log::warn!("Room {room_id} discarded");
        true
    }

    /// Remove rooms that have had no members for at least `ttl`.
    ///
    /// Rooms busy in a critical section are skipped; they are not idle.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut rooms = self.rooms.write().await;
        let mut evicted = Vec::new();

        rooms.retain(|room_id, handle| {
            let Ok(mut room) = handle.try_lock() else {
                return true;
            };
            match room.idle_for(now) {
                Some(idle) if idle >= ttl => {
                    room.retire();
                    evicted.push(room_id.clone());
                    false
                }
                _ => true,
            }
        });

        for room_id in &evicted {
            log::info!("Room {room_id} evicted after {}s without members", ttl.as_secs());
        }
        evicted
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn contains(&self, room_id: &str) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }
}
