//! Wire-backed implementations of the room state seams.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use oasis_rooms::codec;
use oasis_rooms::{Bookmark, BookmarkStore, JoinRequest, RoomError, RoomHandle, RoomService};
use oasis_xmpp::stanza::{self, IqType};
use oasis_xmpp::{Jid, StanzaLink, StanzaTransport, XmppError};
use tracing::debug;

/// Correlation key of a pending MUC join, answered by our own occupant presence.
pub fn join_key(occupant: &Jid) -> String {
    format!("muc-join:{occupant}")
}

/// Correlation key of a pending MUC leave, answered by our unavailable presence.
pub fn leave_key(occupant: &Jid) -> String {
    format!("muc-leave:{occupant}")
}

/// XEP-0402 bookmarks kept in the account's PEP node.
pub struct XmppBookmarkStore<T: StanzaTransport> {
    link: Arc<StanzaLink<T>>,
    timeout: Duration,
}

impl<T: StanzaTransport> XmppBookmarkStore<T> {
    pub fn new(link: Arc<StanzaLink<T>>, timeout: Duration) -> Self {
        Self { link, timeout }
    }
}

impl<T: StanzaTransport> BookmarkStore for XmppBookmarkStore<T> {
    async fn fetch_all(&self) -> Result<Vec<Bookmark>, RoomError> {
        let payload = match self
            .link
            .query(None, IqType::Get, codec::fetch_request(), self.timeout)
            .await
        {
            Ok(payload) => payload,
            Err(XmppError::StanzaError { condition, .. }) if condition == "item-not-found" => {
                debug!("bookmark node does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(codec::decode_fetch_response(payload)?)
    }

    async fn publish(&self, bookmark: &Bookmark) -> Result<(), RoomError> {
        self.link
            .query(None, IqType::Set, codec::publish_request(bookmark), self.timeout)
            .await?;
        Ok(())
    }

    async fn retract(&self, room: &str) -> Result<(), RoomError> {
        self.link
            .query(None, IqType::Set, codec::retract_request(room), self.timeout)
            .await?;
        Ok(())
    }
}

/// MUC join and leave handshakes over presence.
///
/// The answering presence is routed back by `Session::handle_stanza`, which
/// resolves [`join_key`] / [`leave_key`] exchanges.
pub struct XmppRoomService<T: StanzaTransport> {
    link: Arc<StanzaLink<T>>,
    timeout: Duration,
}

impl<T: StanzaTransport> XmppRoomService<T> {
    pub fn new(link: Arc<StanzaLink<T>>, timeout: Duration) -> Self {
        Self { link, timeout }
    }
}

impl<T: StanzaTransport> RoomService for XmppRoomService<T> {
    async fn join(&self, request: &JoinRequest) -> Result<RoomHandle, RoomError> {
        let occupant = request.occupant()?;
        let presence = codec::join_presence(request)?;
        let answer = self
            .link
            .exchange(&join_key(&occupant), presence, self.timeout)
            .await?;

        if let Some(XmppError::StanzaError { condition, .. }) = stanza::stanza_error(&answer) {
            return Err(RoomError::JoinRejected {
                room: request.room.clone(),
                condition,
            });
        }

        Ok(RoomHandle {
            room: request.room.clone(),
            nick: request.nick.clone(),
            joined_at: Utc::now(),
        })
    }

    async fn leave(&self, handle: &RoomHandle, reason: Option<&str>) -> Result<(), RoomError> {
        let occupant = handle.occupant()?;
        self.link
            .exchange(
                &leave_key(&occupant),
                codec::leave_presence(&occupant, reason),
                self.timeout,
            )
            .await?;
        Ok(())
    }
}
