use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use oasis_xmpp::FullJid;
use tracing::{debug, info, warn};

use crate::bookmarks::{Bookmark, room_key};
use crate::codec;
use crate::error::RoomError;

/// Legacy MUC history to request on join. All limits are optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryOptions {
    pub duration: Option<Duration>,
    pub max_stanzas: Option<u64>,
    pub since: Option<DateTime<Utc>>,
}

impl HistoryOptions {
    /// Ask the room for no history at all.
    pub fn none() -> Self {
        Self {
            max_stanzas: Some(0),
            ..Self::default()
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room: String,
    pub nick: String,
    pub password: Option<String>,
    pub history: HistoryOptions,
}

impl JoinRequest {
    pub fn from_bookmark(bookmark: &Bookmark, history: HistoryOptions) -> Result<Self, RoomError> {
        if bookmark.nick.trim().is_empty() {
            return Err(RoomError::Validation {
                field: "nick",
                reason: format!("no nickname for {}", bookmark.room),
            });
        }
        let occupant = codec::occupant_jid(&bookmark.room, &bookmark.nick)?;

        Ok(Self {
            room: occupant.to_bare().to_string(),
            nick: bookmark.nick.clone(),
            password: bookmark.password.clone(),
            history,
        })
    }

    pub fn occupant(&self) -> Result<FullJid, RoomError> {
        codec::occupant_jid(&self.room, &self.nick)
    }
}

/// A room this session is currently in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    pub room: String,
    pub nick: String,
    pub joined_at: DateTime<Utc>,
}

impl RoomHandle {
    pub fn occupant(&self) -> Result<FullJid, RoomError> {
        codec::occupant_jid(&self.room, &self.nick)
    }
}

/// Performs the MUC handshakes on the wire.
pub trait RoomService: Send + Sync {
    fn join(&self, request: &JoinRequest) -> impl Future<Output = Result<RoomHandle, RoomError>> + Send;

    fn leave(
        &self,
        handle: &RoomHandle,
        reason: Option<&str>,
    ) -> impl Future<Output = Result<(), RoomError>> + Send;
}

/// Joined rooms keyed by bare room JID.
///
/// Handles are built completely before they are inserted, so a lookup racing
/// a join sees either nothing or the finished handle.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<RoomHandle>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join<S: RoomService>(
        &self,
        service: &S,
        bookmark: &Bookmark,
        history: HistoryOptions,
    ) -> Result<Arc<RoomHandle>, RoomError> {
        let request = JoinRequest::from_bookmark(bookmark, history)?;
        debug!(room = %request.room, nick = %request.nick, "joining room");

        let handle = Arc::new(service.join(&request).await?);

        let replaced = self
            .rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.room.clone(), Arc::clone(&handle));
        if replaced.is_some() {
            warn!(room = %handle.room, "rejoined a room that was already tracked");
        }
        info!(room = %handle.room, nick = %handle.nick, "joined room");
        Ok(handle)
    }

    /// Leave `room`. The handle stays registered if the leave fails, so the
    /// caller can retry.
    pub async fn leave<S: RoomService>(
        &self,
        service: &S,
        room: &str,
        reason: Option<&str>,
    ) -> Result<(), RoomError> {
        let handle = self
            .get(room)
            .ok_or_else(|| RoomError::RoomNotFound(room.to_string()))?;

        service.leave(&handle, reason).await?;

        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        if rooms
            .get(&handle.room)
            .is_some_and(|current| Arc::ptr_eq(current, &handle))
        {
            rooms.remove(&handle.room);
        }
        drop(rooms);

        info!(room = %handle.room, "left room");
        Ok(())
    }

    pub fn get(&self, room: &str) -> Option<Arc<RoomHandle>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&room_key(room))
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Arc<RoomHandle>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget every room, e.g. after the stream went away.
    pub fn clear(&self) -> usize {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let count = rooms.len();
        rooms.clear();
        count
    }
}
