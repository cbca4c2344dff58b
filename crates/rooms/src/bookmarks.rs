use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};
use xmpp_parsers::jid::BareJid;

use crate::error::RoomError;

/// A room the account wants to remember.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bookmark {
    /// Bare JID of the room
    pub room: String,
    pub name: Option<String>,
    pub nick: String,
    pub password: Option<String>,
    pub autojoin: bool,
}

impl Bookmark {
    pub fn new(room: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            name: None,
            nick: nick.into(),
            password: None,
            autojoin: false,
        }
    }

    pub fn with_autojoin(mut self, autojoin: bool) -> Self {
        self.autojoin = autojoin;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn validate(&self) -> Result<(), RoomError> {
        self.room_jid().map(|_| ())
    }

    pub fn room_jid(&self) -> Result<BareJid, RoomError> {
        BareJid::new(&self.room).map_err(|e| RoomError::Validation {
            field: "room",
            reason: format!("{}: {e}", self.room),
        })
    }

    /// Rewrite the room in its normalized form, which is how the cache keys it.
    fn normalized(mut self) -> Result<Self, RoomError> {
        self.room = self.room_jid()?.to_string();
        Ok(self)
    }
}

/// Cache key for a room as given by a caller or the server.
pub(crate) fn room_key(room: &str) -> String {
    BareJid::new(room)
        .map(|jid| jid.to_string())
        .unwrap_or_else(|_| room.to_string())
}

/// Change announced by the server for a single bookmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookmarkPush {
    Upsert(Bookmark),
    Retract(String),
}

/// Remote side of the bookmark cache.
pub trait BookmarkStore: Send + Sync + 'static {
    fn fetch_all(&self) -> impl Future<Output = Result<Vec<Bookmark>, RoomError>> + Send;

    fn publish(&self, bookmark: &Bookmark) -> impl Future<Output = Result<(), RoomError>> + Send;

    fn retract(&self, room: &str) -> impl Future<Output = Result<(), RoomError>> + Send;
}

/// Receives a copy of each bookmark emitted by the cache.
pub type BookmarkSubscriber = Arc<dyn Fn(Bookmark) + Send + Sync>;

#[derive(Default)]
struct Cache {
    entries: HashMap<String, Bookmark>,
    /// Bumped by every local write and server push
    generation: u64,
    /// Generation of the last change to each room, kept while a refresh is
    /// in flight
    changed: HashMap<String, u64>,
    refreshing: usize,
}

impl Cache {
    fn touch(&mut self, room: &str) {
        self.generation += 1;
        if self.refreshing > 0 {
            self.changed.insert(room.to_string(), self.generation);
        }
    }

    fn insert(&mut self, bookmark: Bookmark) {
        self.touch(&bookmark.room);
        self.entries.insert(bookmark.room.clone(), bookmark);
    }

    fn remove(&mut self, room: &str) {
        self.touch(room);
        self.entries.remove(room);
    }
}

/// Write-through cache of the account's bookmarks.
///
/// The map is only replaced or touched after the remote side has accepted
/// the change, so a failed publish leaves it as it was. A refresh never
/// reverts a change made after its fetch started.
pub struct BookmarkManager<S: BookmarkStore> {
    store: S,
    cache: RwLock<Cache>,
    subscriber: RwLock<Option<BookmarkSubscriber>>,
}

impl<S: BookmarkStore> BookmarkManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: RwLock::new(Cache::default()),
            subscriber: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replace the cache with the server's bookmark set and emit every entry
    /// to the subscriber.
    ///
    /// Rooms published, deleted or pushed while the fetch was in flight keep
    /// their local state instead of the fetched one.
    pub async fn refresh(&self) -> Result<usize, RoomError> {
        let started = {
            let mut cache = self.write();
            cache.refreshing += 1;
            cache.generation
        };
        let fetched = self.store.fetch_all().await;

        let mut cache = self.write();
        cache.refreshing -= 1;
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                if cache.refreshing == 0 {
                    cache.changed.clear();
                }
                return Err(e);
            }
        };

        let mut replacement = HashMap::with_capacity(fetched.len());
        for bookmark in fetched {
            match bookmark.normalized() {
                Ok(bookmark) => {
                    replacement.insert(bookmark.room.clone(), bookmark);
                }
                Err(e) => warn!(error = %e, "skipping malformed bookmark from server"),
            }
        }

        let mut kept = 0;
        for (room, generation) in &cache.changed {
            if *generation <= started {
                continue;
            }
            kept += 1;
            match cache.entries.get(room) {
                Some(bookmark) => replacement.insert(room.clone(), bookmark.clone()),
                None => replacement.remove(room),
            };
        }
        if cache.refreshing == 0 {
            cache.changed.clear();
        }

        let emitted: Vec<Bookmark> = replacement.values().cloned().collect();
        cache.entries = replacement;
        cache.generation += 1;
        drop(cache);

        debug!(count = emitted.len(), kept, "bookmark cache refreshed");
        let count = emitted.len();
        self.emit_all(emitted);
        Ok(count)
    }

    pub async fn publish(&self, bookmark: Bookmark) -> Result<(), RoomError> {
        let bookmark = bookmark.normalized()?;
        self.store.publish(&bookmark).await?;

        debug!(room = %bookmark.room, autojoin = bookmark.autojoin, "bookmark published");
        self.write().insert(bookmark);
        Ok(())
    }

    pub async fn delete(&self, room: &str) -> Result<(), RoomError> {
        let room = room_key(room);
        self.store.retract(&room).await?;

        debug!(room = %room, "bookmark retracted");
        self.write().remove(&room);
        Ok(())
    }

    /// Flip the autojoin flag of a cached bookmark and publish the result.
    ///
    /// The cache is trusted as a mirror of the server: an unknown room fails
    /// without any network traffic.
    pub async fn toggle_autojoin(&self, room: &str, autojoin: bool) -> Result<(), RoomError> {
        let mut bookmark = self
            .get(room)
            .ok_or_else(|| RoomError::BookmarkNotFound(room.to_string()))?;
        bookmark.autojoin = autojoin;
        self.publish(bookmark).await
    }

    pub fn get(&self, room: &str) -> Option<Bookmark> {
        self.read().entries.get(&room_key(room)).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Bookmark> {
        self.read().entries.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Install the subscriber, returning the one it replaces.
    pub fn set_subscriber(&self, subscriber: BookmarkSubscriber) -> Option<BookmarkSubscriber> {
        let previous = self
            .subscriber
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(subscriber);
        if previous.is_some() {
            info!("bookmark subscriber replaced");
        }
        previous
    }

    /// Apply a change pushed by the server without a round trip.
    pub fn apply_push(&self, push: BookmarkPush) {
        match push {
            BookmarkPush::Upsert(bookmark) => {
                let bookmark = match bookmark.normalized() {
                    Ok(bookmark) => bookmark,
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed bookmark push");
                        return;
                    }
                };
                debug!(room = %bookmark.room, "bookmark pushed by server");
                self.write().insert(bookmark.clone());
                self.emit_all(vec![bookmark]);
            }
            BookmarkPush::Retract(room) => {
                let room = room_key(&room);
                debug!(room = %room, "bookmark retracted by server");
                self.write().remove(&room);
            }
        }
    }

    fn emit_all(&self, bookmarks: Vec<Bookmark>) {
        let subscriber = self
            .subscriber
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(subscriber) = subscriber else {
            return;
        };
        for bookmark in bookmarks {
            subscriber(bookmark);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Cache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Cache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}
