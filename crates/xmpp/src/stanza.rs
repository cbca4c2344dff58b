use std::collections::BTreeMap;

pub use xmpp_parsers::iq::Iq;
pub use xmpp_parsers::jid::{BareJid, FullJid, Jid};
pub use xmpp_parsers::minidom::rxml::xml_ncname;
pub use xmpp_parsers::minidom::{Element, ElementBuilder};

use uuid::Uuid;
use xmpp_parsers::iq::{IqHeader, IqPayload};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::error::{DecodeError, XmppError};

pub mod ns {
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    pub const PING: &str = "urn:xmpp:ping";
    pub const DELAY: &str = "urn:xmpp:delay";
    pub const SID: &str = "urn:xmpp:sid:0";
    pub const REPLY: &str = "urn:xmpp:reply:0";
    pub const FALLBACK: &str = "urn:xmpp:fallback:0";
    pub const RECEIPTS: &str = "urn:xmpp:receipts";
    pub const CHAT_MARKERS: &str = "urn:xmpp:chat-markers:0";
    pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
    pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
    pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
    pub const BOOKMARKS2: &str = "urn:xmpp:bookmarks:1";
    pub const DATA_FORMS: &str = "jabber:x:data";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const HTTP_UPLOAD: &str = "urn:xmpp:http:upload:0";
}

/// Request kinds sent through [`crate::StanzaLink::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqType {
    Get,
    Set,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
        }
    }
}

/// Conversation context of a message stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// One-to-one chat (`type='chat'`)
    Direct,
    /// Multi-user chat (`type='groupchat'`)
    Group,
}

impl MessageKind {
    pub fn from_type_attr(value: Option<&str>) -> Option<Self> {
        match value {
            Some("chat") => Some(Self::Direct),
            Some("groupchat") => Some(Self::Group),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "chat",
            Self::Group => "groupchat",
        }
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build a `get` or `set` request around `payload`.
pub fn request(id: &str, iq_type: IqType, to: Option<&Jid>, payload: Element) -> Iq {
    let header = IqHeader {
        from: None,
        to: to.cloned(),
        id: id.to_string(),
    };
    let payload = match iq_type {
        IqType::Get => IqPayload::Get(payload),
        IqType::Set => IqPayload::Set(payload),
    };
    header.assemble(payload)
}

/// Empty result answering `request`.
pub fn iq_result(request: &Iq) -> Iq {
    Iq::Result {
        from: None,
        to: request.from().cloned(),
        id: request.id().to_string(),
        payload: None,
    }
}

/// Error answering `request` with a defined condition (RFC 6120 section 8.3).
pub fn iq_error(request: &Iq, type_: ErrorType, condition: DefinedCondition) -> Iq {
    let error = StanzaError {
        type_,
        by: None,
        defined_condition: condition,
        texts: BTreeMap::new(),
        other: None,
    };
    Iq::Error {
        from: None,
        to: request.from().cloned(),
        id: request.id().to_string(),
        error,
        payload: None,
    }
}

/// Turn a `type='error'` stanza into an [`XmppError::StanzaError`].
///
/// An `<error/>` that does not decode still yields `undefined-condition`.
pub fn stanza_error(stanza: &Element) -> Option<XmppError> {
    if stanza.attr("type") != Some("error") {
        return None;
    }

    let error = stanza
        .get_child("error", ns::JABBER_CLIENT)
        .cloned()
        .and_then(|error| StanzaError::try_from(error).ok());

    Some(match error {
        Some(error) => XmppError::from(&error),
        None => XmppError::StanzaError {
            condition: "undefined-condition".to_string(),
            text: None,
        },
    })
}

pub fn required_attr<'a>(
    element: &'a Element,
    element_name: &'static str,
    attribute: &'static str,
) -> Result<&'a str, DecodeError> {
    element
        .attr(attribute)
        .ok_or(DecodeError::MissingAttribute {
            element: element_name,
            attribute,
        })
}

pub fn expect_element(
    element: &Element,
    name: &'static str,
    namespace: &str,
) -> Result<(), DecodeError> {
    if element.is(name, namespace) {
        Ok(())
    } else {
        Err(DecodeError::UnexpectedElement {
            expected: name,
            found: element.name().to_string(),
        })
    }
}

/// Parse a JID-valued attribute. Node and domain are normalized, so
/// `Bot@Example.com` and `bot@example.com` compare equal afterwards.
pub fn parse_jid(field: &'static str, value: &str) -> Result<Jid, DecodeError> {
    Jid::new(value).map_err(|_| DecodeError::InvalidValue {
        field,
        value: value.to_string(),
    })
}
