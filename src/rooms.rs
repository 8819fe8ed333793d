//! Room membership for realtime sessions
//!
//! One registry per gateway process. Rooms are named by project slug; a
//! session joins any number of rooms and receives every frame broadcast to
//! them. All membership state sits behind a single mutex and is only changed
//! through the registry's methods, so a disconnect removes a session from all
//! of its rooms in one step.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifier of one realtime connection
pub type SessionId = Uuid;

/// Frames queued for a session's writer task
pub type Outbox = mpsc::Sender<Arc<String>>;

struct SessionEntry {
    outbox: Outbox,
    rooms: HashSet<String>,
}

#[derive(Default)]
struct Membership {
    rooms: HashMap<String, HashSet<SessionId>>,
    sessions: HashMap<SessionId, SessionEntry>,
}

/// Snapshot of registry sizes for health reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStats {
    pub sessions: usize,
    pub rooms: usize,
    pub dropped_frames: u64,
}

#[derive(Default)]
pub struct RoomRegistry {
    inner: Mutex<Membership>,
    dropped_frames: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session with the channel its frames are written to
    pub fn register(&self, outbox: Outbox) -> SessionId {
        let id = Uuid::new_v4();
        self.inner.lock().sessions.insert(
            id,
            SessionEntry {
                outbox,
                rooms: HashSet::new(),
            },
        );
        debug!(session = %id, "Session registered");
        id
    }

    /// Add a session to a room. Returns `false` if it was already a member
    /// or is no longer registered.
    pub fn join(&self, session: SessionId, room: &str) -> bool {
        join_locked(&mut self.inner.lock(), session, room)
    }

    /// Join a room and queue `ack` for the session under the same lock, so
    /// the ack reaches the session before any frame broadcast to the room
    /// afterwards. The ack is sent even when the session was already a member.
    pub fn join_with_ack(&self, session: SessionId, room: &str, ack: &str) -> bool {
        let mut inner = self.inner.lock();
        let joined = join_locked(&mut inner, session, room);
        if let Some(entry) = inner.sessions.get(&session) {
            if entry.outbox.try_send(Arc::new(ack.to_string())).is_err() {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
        joined
    }

    /// Remove a session from one room. Returns `false` if it wasn't a member.
    pub fn leave(&self, session: SessionId, room: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner
            .sessions
            .get_mut(&session)
            .map(|entry| entry.rooms.remove(room))
            .unwrap_or(false);
        if removed {
            remove_member(&mut inner.rooms, room, session);
        }
        removed
    }

    /// Drop a session and all of its memberships
    pub fn disconnect(&self, session: SessionId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.sessions.remove(&session) else {
            return;
        };
        for room in &entry.rooms {
            remove_member(&mut inner.rooms, room, session);
        }
        debug!(session = %session, rooms = entry.rooms.len(), "Session disconnected");
    }

    /// Queue a frame for every member of a room; returns how many accepted it.
    ///
    /// Delivery never blocks: a session whose buffer is full misses the frame.
    pub fn broadcast(&self, room: &str, frame: &str) -> usize {
        let frame = Arc::new(frame.to_string());
        let inner = self.inner.lock();
        let Some(members) = inner.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            let Some(entry) = inner.sessions.get(id) else {
                continue;
            };
            match entry.outbox.try_send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                    warn!(session = %id, room, "Session buffer full, frame dropped");
                }
                // Writer already gone; disconnect will clean up shortly
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Rooms a session currently belongs to
    pub fn rooms_of(&self, session: SessionId) -> Vec<String> {
        self.inner
            .lock()
            .sessions
            .get(&session)
            .map(|entry| entry.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.inner.lock().rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> RoomStats {
        let inner = self.inner.lock();
        RoomStats {
            sessions: inner.sessions.len(),
            rooms: inner.rooms.len(),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

fn join_locked(inner: &mut Membership, session: SessionId, room: &str) -> bool {
    let Some(entry) = inner.sessions.get_mut(&session) else {
        return false;
    };
    if !entry.rooms.insert(room.to_string()) {
        return false;
    }
    inner
        .rooms
        .entry(room.to_string())
        .or_default()
        .insert(session);
    true
}

/// Remove one member, dropping the room once it's empty
fn remove_member(rooms: &mut HashMap<String, HashSet<SessionId>>, room: &str, session: SessionId) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(&session);
        if members.is_empty() {
            rooms.remove(room);
        }
    }
}
