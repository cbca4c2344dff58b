//! Wire formats for XEP-0402 bookmarks and XEP-0045 presence.

use oasis_xmpp::DecodeError;
use oasis_xmpp::stanza::{self, BareJid, Element, FullJid, ns};
use xmpp_parsers::bookmarks2::Conference;
use xmpp_parsers::data_forms::{DataForm, DataFormType, Field};
use xmpp_parsers::date::DateTime;
use xmpp_parsers::jid::ResourcePart;
use xmpp_parsers::muc::muc::History;
use xmpp_parsers::muc::user::Status;
use xmpp_parsers::muc::{Muc, MucUser};
use xmpp_parsers::presence::Presence;
use xmpp_parsers::pubsub::event::{Event, Payload};
use xmpp_parsers::pubsub::pubsub::{Item, Items, Publish, PublishOptions, Retract};
use xmpp_parsers::pubsub::{ItemId, NodeName, PubSub};

use crate::bookmarks::{Bookmark, BookmarkPush};
use crate::error::RoomError;
use crate::membership::{HistoryOptions, JoinRequest};

const PUBLISH_OPTIONS: &str = "http://jabber.org/protocol/pubsub#publish-options";

fn bookmarks_node() -> NodeName {
    NodeName(ns::BOOKMARKS2.to_string())
}

/// `<pubsub><items node='urn:xmpp:bookmarks:1'/></pubsub>`
pub fn fetch_request() -> Element {
    PubSub::Items(Items::new(ns::BOOKMARKS2)).into()
}

/// Publish `bookmark` as a private, persistent PEP item.
pub fn publish_request(bookmark: &Bookmark) -> Element {
    let item = Item {
        id: Some(ItemId(bookmark.room.clone())),
        publisher: None,
        payload: Some(encode_conference(bookmark).into()),
    };
    let options = DataForm::new(
        DataFormType::Submit,
        PUBLISH_OPTIONS,
        vec![
            Field::text_single("pubsub#persist_items", "true"),
            Field::text_single("pubsub#max_items", "max"),
            Field::text_single("pubsub#send_last_published_item", "never"),
            Field::text_single("pubsub#access_model", "whitelist"),
        ],
    );

    PubSub::Publish {
        publish: Publish {
            node: bookmarks_node(),
            items: vec![item],
        },
        publish_options: Some(PublishOptions {
            form: Some(options),
        }),
    }
    .into()
}

pub fn retract_request(room: &str) -> Element {
    PubSub::Retract(Retract {
        node: bookmarks_node(),
        notify: true,
        items: vec![Item {
            id: Some(ItemId(room.to_string())),
            publisher: None,
            payload: None,
        }],
    })
    .into()
}

/// Bookmarks carried by the result of [`fetch_request`].
///
/// An IQ result without a pubsub payload means the node is empty.
pub fn decode_fetch_response(payload: Option<Element>) -> Result<Vec<Bookmark>, DecodeError> {
    let Some(payload) = payload else {
        return Ok(Vec::new());
    };
    match PubSub::try_from(payload).map_err(|e| DecodeError::malformed("pubsub", e))? {
        PubSub::Items(items) => items
            .items
            .into_iter()
            .map(|item| decode_item(item.id, item.payload))
            .collect(),
        _ => Err(DecodeError::MissingChild {
            element: "pubsub",
            child: "items",
        }),
    }
}

/// Bookmark changes in a PEP event message, or `None` if the message is not
/// a bookmark notification.
///
/// Upserts come before retractions.
pub fn decode_push(message: &Element) -> Option<Result<Vec<BookmarkPush>, DecodeError>> {
    let event = message.get_child("event", ns::PUBSUB_EVENT).filter(|event| {
        event
            .get_child("items", ns::PUBSUB_EVENT)
            .and_then(|items| items.attr("node"))
            == Some(ns::BOOKMARKS2)
    })?;
    Some(decode_event(event.clone()))
}

fn decode_event(event: Element) -> Result<Vec<BookmarkPush>, DecodeError> {
    let Event { payload } = Event::try_from(event).map_err(|e| DecodeError::malformed("event", e))?;
    let Payload::Items {
        published,
        retracted,
        ..
    } = payload
    else {
        return Err(DecodeError::MissingChild {
            element: "event",
            child: "items",
        });
    };

    let mut pushes = published
        .into_iter()
        .map(|item| decode_item(item.id, item.payload).map(BookmarkPush::Upsert))
        .collect::<Result<Vec<_>, _>>()?;
    pushes.extend(retracted.into_iter().map(|id| BookmarkPush::Retract(id.0)));
    Ok(pushes)
}

fn decode_item(id: Option<ItemId>, payload: Option<Element>) -> Result<Bookmark, DecodeError> {
    let room = id.ok_or(DecodeError::MissingAttribute {
        element: "item",
        attribute: "id",
    })?;
    let payload = payload.ok_or(DecodeError::MissingChild {
        element: "item",
        child: "conference",
    })?;
    stanza::expect_element(&payload, "conference", ns::BOOKMARKS2)?;
    let conference =
        Conference::try_from(payload).map_err(|e| DecodeError::malformed("conference", e))?;

    Ok(Bookmark {
        room: room.0,
        name: conference.name,
        nick: conference.nick.map(|nick| nick.to_string()).unwrap_or_default(),
        password: conference.password,
        autojoin: conference.autojoin,
    })
}

fn encode_conference(bookmark: &Bookmark) -> Conference {
    Conference {
        autojoin: bookmark.autojoin,
        name: bookmark.name.clone(),
        nick: bookmark.nick.parse::<ResourcePart>().ok(),
        password: bookmark.password.clone(),
        extensions: None,
    }
}

/// Occupant JID a join request is addressed to.
pub fn occupant_jid(room: &str, nick: &str) -> Result<FullJid, RoomError> {
    let room = BareJid::new(room).map_err(|e| RoomError::Validation {
        field: "room",
        reason: format!("{room}: {e}"),
    })?;
    room.with_resource_str(nick)
        .map_err(|e| RoomError::Validation {
            field: "nick",
            reason: format!("{nick}: {e}"),
        })
}

/// Initial presence entering a room.
pub fn join_presence(request: &JoinRequest) -> Result<Element, RoomError> {
    let occupant = occupant_jid(&request.room, &request.nick)?;
    let muc = Muc {
        password: request.password.clone(),
        history: encode_history(&request.history),
    };
    Ok(Presence::available()
        .with_id(stanza::new_id())
        .with_to(occupant)
        .with_payload(muc)
        .into())
}

/// Unavailable presence leaving a room, with an optional reason.
pub fn leave_presence(occupant: &FullJid, reason: Option<&str>) -> Element {
    let mut presence = Presence::unavailable()
        .with_id(stanza::new_id())
        .with_to(occupant.clone());
    if let Some(reason) = reason.filter(|reason| !reason.is_empty()) {
        presence.set_status("", reason);
    }
    presence.into()
}

fn encode_history(history: &HistoryOptions) -> Option<History> {
    if history.is_default() {
        return None;
    }
    let clamp = |value: u64| u32::try_from(value).unwrap_or(u32::MAX);
    Some(History {
        maxchars: None,
        maxstanzas: history.max_stanzas.map(clamp),
        seconds: history.duration.map(|duration| clamp(duration.as_secs())),
        since: history.since.map(|since| DateTime(since.fixed_offset())),
    })
}

/// The `muc#user` payload of an occupant presence, if it decodes.
pub fn muc_user(presence: &Element) -> Option<MucUser> {
    presence
        .get_child("x", ns::MUC_USER)
        .cloned()
        .and_then(|x| MucUser::try_from(x).ok())
}

/// Whether a presence carries the MUC status code 110 marking it as our own.
pub fn is_self_presence(presence: &Element) -> bool {
    muc_user(presence).is_some_and(|x| x.status.contains(&Status::SelfPresence))
}
