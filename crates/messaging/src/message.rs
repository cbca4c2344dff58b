use oasis_xmpp::stanza::{self, BareJid, Element, Jid, MessageKind, ns};
use oasis_xmpp::DecodeError;

use crate::body::ChatMessageBody;

/// Routing attributes of a message stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub id: Option<String>,
    pub from: Jid,
    pub to: Option<Jid>,
    pub kind: MessageKind,
}

impl MessageHeader {
    pub fn from_element(message: &Element) -> Result<Self, DecodeError> {
        stanza::expect_element(message, "message", ns::JABBER_CLIENT)?;

        let kind = MessageKind::from_type_attr(message.attr("type")).ok_or_else(|| {
            DecodeError::InvalidValue {
                field: "message type",
                value: message.attr("type").unwrap_or_default().to_string(),
            }
        })?;

        let from = stanza::required_attr(message, "message", "from")?;
        Ok(Self {
            id: message.attr("id").map(str::to_string),
            from: stanza::parse_jid("from", from)?,
            to: message.attr("to").map(|to| stanza::parse_jid("to", to)).transpose()?,
            kind,
        })
    }

    /// Bare JID of the conversation: the peer for direct chats, the room for
    /// group chats.
    pub fn conversation(&self) -> BareJid {
        self.from.to_bare()
    }

    /// Occupant nickname for group messages.
    pub fn nick(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Group => self.from.resource().map(|nick| nick.as_str()),
            MessageKind::Direct => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub header: MessageHeader,
    pub body: ChatMessageBody,
}

impl ChatMessage {
    /// Decode a chat or groupchat message and derive its reply parts.
    pub fn from_element(message: &Element) -> Result<Self, DecodeError> {
        let header = MessageHeader::from_element(message)?;
        let body = ChatMessageBody::from_element(message);
        body.parse_reply();
        Ok(Self { header, body })
    }

    pub fn cleaned_body(&self) -> Option<&str> {
        self.body.cleaned_body()
    }

    /// Identifier a reply or read marker should reference.
    pub fn reference_id(&self) -> Option<&str> {
        match self.header.kind {
            MessageKind::Group => {
                let room = self.header.conversation();
                self.body.reply_target_id(Some(&room))
            }
            MessageKind::Direct => self
                .body
                .reply_target_id(None)
                .or(self.header.id.as_deref()),
        }
    }
}
