use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use oasis_xmpp::stanza::{self, BareJid, Element, Jid, ns};
use oasis_xmpp::DecodeError;
use tracing::{debug, warn};
use xmpp_parsers::presence::{Presence, Show, Type as PresenceType};
use xso::FromXmlText;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresenceError {
    #[error("invalid priority value: {0} (must be -128..127)")]
    InvalidPriority(i16),

    #[error("cannot broadcast non-standard show value {0:?}")]
    UnsupportedShow(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Availability as carried by `<show/>`, folded together with `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceShow {
    Available,
    Chat,
    Away,
    Xa,
    Dnd,
    Unavailable,
    /// A `<show/>` value outside RFC 6121
    Unknown(String),
}

impl PresenceShow {
    fn from_show(value: &str) -> Self {
        match value {
            "chat" => Self::Chat,
            "away" => Self::Away,
            "xa" => Self::Xa,
            "dnd" => Self::Dnd,
            other => Self::Unknown(other.to_string()),
        }
    }

    fn to_show(&self) -> Result<Option<Show>, PresenceError> {
        Ok(match self {
            Self::Chat => Some(Show::Chat),
            Self::Away => Some(Show::Away),
            Self::Xa => Some(Show::Xa),
            Self::Dnd => Some(Show::Dnd),
            Self::Unknown(value) => return Err(PresenceError::UnsupportedShow(value.clone())),
            Self::Available | Self::Unavailable => None,
        })
    }
}

/// The `type` attribute of a presence stanza; absent means available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    /// A server asking for the current presence of the recipient.
    StatusRequest,
    Error,
}

impl PresenceKind {
    fn parse(value: Option<&str>) -> Result<Self, DecodeError> {
        let Some(value) = value else {
            return Ok(Self::Available);
        };
        let kind = PresenceType::from_xml_text(value.to_string()).map_err(|_| {
            DecodeError::InvalidValue {
                field: "presence type",
                value: value.to_string(),
            }
        })?;
        Ok(match kind {
            PresenceType::None => Self::Available,
            PresenceType::Unavailable => Self::Unavailable,
            PresenceType::Subscribe => Self::Subscribe,
            PresenceType::Subscribed => Self::Subscribed,
            PresenceType::Unsubscribe => Self::Unsubscribe,
            PresenceType::Unsubscribed => Self::Unsubscribed,
            PresenceType::Error => Self::Error,
            _ => Self::StatusRequest,
        })
    }

    /// Whether this stanza says anything about availability.
    pub fn is_availability(self) -> bool {
        matches!(self, Self::Available | Self::Unavailable)
    }
}

/// Inbound presence.
///
/// Decoded by hand rather than through the typed `Presence`, which rejects
/// `<show/>` values outside RFC 6121 instead of keeping them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub from: Jid,
    pub kind: PresenceKind,
    pub show: PresenceShow,
    pub status: Option<String>,
    pub priority: i8,
    /// Sent by a MUC room on behalf of one of its occupants (`<x/>` in the
    /// muc#user namespace)
    pub occupant: bool,
}

impl PresenceEvent {
    pub fn from_element(presence: &Element) -> Result<Self, DecodeError> {
        stanza::expect_element(presence, "presence", ns::JABBER_CLIENT)?;
        let from = stanza::required_attr(presence, "presence", "from")?;
        let from = stanza::parse_jid("from", from)?;
        let kind = PresenceKind::parse(presence.attr("type"))?;

        let show = match kind {
            PresenceKind::Unavailable => PresenceShow::Unavailable,
            _ => presence
                .get_child("show", ns::JABBER_CLIENT)
                .map(|show| PresenceShow::from_show(show.text().trim()))
                .unwrap_or(PresenceShow::Available),
        };
        let status = presence
            .get_child("status", ns::JABBER_CLIENT)
            .map(Element::text)
            .filter(|text| !text.is_empty());
        let priority = match presence.get_child("priority", ns::JABBER_CLIENT) {
            Some(priority) => {
                let raw = priority.text();
                raw.trim().parse::<i8>().map_err(|_| DecodeError::InvalidValue {
                    field: "priority",
                    value: raw.clone(),
                })?
            }
            None => 0,
        };

        Ok(Self {
            occupant: from.is_full() && presence.get_child("x", ns::MUC_USER).is_some(),
            from,
            kind,
            show,
            status,
            priority,
        })
    }
}

/// Broadcast presence for this account.
pub fn own_presence(
    show: &PresenceShow,
    status: Option<&str>,
    priority: i16,
) -> Result<Element, PresenceError> {
    let priority = i8::try_from(priority).map_err(|_| PresenceError::InvalidPriority(priority))?;

    let mut presence = match show {
        PresenceShow::Unavailable => Presence::unavailable(),
        _ => Presence::available(),
    };
    presence.show = show.to_show()?;
    if let Some(status) = status {
        presence.set_status("", status);
    }
    Ok(presence.with_priority(priority).into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceInfo {
    pub jid: String,
    pub show: PresenceShow,
    pub status: Option<String>,
    pub priority: i8,
    pub last_updated: DateTime<Utc>,
}

impl PresenceInfo {
    fn of(event: &PresenceEvent, jid: &str) -> Self {
        Self {
            jid: jid.to_string(),
            show: event.show.clone(),
            status: event.status.clone(),
            priority: event.priority,
            last_updated: Utc::now(),
        }
    }

    fn unavailable(jid: &str) -> Self {
        Self {
            jid: jid.to_string(),
            show: PresenceShow::Unavailable,
            status: None,
            priority: 0,
            last_updated: Utc::now(),
        }
    }
}

#[derive(Default)]
struct Presences {
    contacts: HashMap<BareJid, PresenceInfo>,
    /// MUC occupants, keyed by occupant JID so they never shadow the room
    occupants: HashMap<Jid, PresenceInfo>,
}

/// Last known availability per bare JID, and per occupant JID for rooms.
#[derive(Default)]
pub struct PresenceTracker {
    presences: RwLock<Presences>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Presence of an occupant when `jid` is a known occupant JID, otherwise
    /// of the bare JID.
    pub fn get_presence(&self, jid: &str) -> PresenceInfo {
        let Ok(jid) = Jid::new(jid) else {
            return PresenceInfo::unavailable(jid);
        };
        let presences = self.presences.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = presences.occupants.get(&jid) {
            return info.clone();
        }
        let bare = jid.to_bare();
        presences
            .contacts
            .get(&bare)
            .cloned()
            .unwrap_or_else(|| PresenceInfo::unavailable(bare.as_str()))
    }

    /// Record `event`; subscription and error stanzas leave the map alone.
    pub fn apply(&self, event: &PresenceEvent) {
        if !event.kind.is_availability() {
            debug!(from = %event.from, kind = ?event.kind, "presence carries no availability");
            return;
        }
        if let PresenceShow::Unknown(value) = &event.show {
            warn!(from = %event.from, show = %value, "unknown presence show value");
        }

        let mut presences = self.presences.write().unwrap_or_else(PoisonError::into_inner);
        if event.occupant {
            if event.kind == PresenceKind::Unavailable {
                debug!(occupant = %event.from, "occupant left");
                presences.occupants.remove(&event.from);
            } else {
                debug!(occupant = %event.from, show = ?event.show, "occupant presence changed");
                let info = PresenceInfo::of(event, event.from.as_str());
                presences.occupants.insert(event.from.clone(), info);
            }
            return;
        }

        let bare = event.from.to_bare();
        debug!(jid = %bare, show = ?event.show, "contact presence changed");
        let info = PresenceInfo::of(event, bare.as_str());
        presences.contacts.insert(bare, info);
    }

    /// Forget everything, e.g. once the stream is gone.
    pub fn clear(&self) {
        debug!("clearing presence map");
        let mut presences = self.presences.write().unwrap_or_else(PoisonError::into_inner);
        presences.contacts.clear();
        presences.occupants.clear();
    }
}
