use oasis_xmpp::stanza::{self, Element, MessageKind, ns, xml_ncname};
use oasis_xmpp::DecodeError;
use xmpp_parsers::receipts::Received;

use crate::compose;
use crate::error::MessagingError;
use crate::message::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiptKind {
    /// XEP-0184 `<received/>`
    Delivered,
    /// XEP-0333 `<displayed/>`
    Displayed,
}

impl ReceiptKind {
    /// Kind of receipt a payload element represents, if any.
    pub fn of(element: &Element) -> Option<Self> {
        if element.is("received", ns::RECEIPTS) {
            Some(Self::Delivered)
        } else if element.is("displayed", ns::CHAT_MARKERS) {
            Some(Self::Displayed)
        } else {
            None
        }
    }
}

/// Acknowledgement that a previously sent message was delivered or read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub kind: ReceiptKind,
    /// Identifier of the acknowledged message
    pub id: String,
}

impl Receipt {
    pub fn from_element(element: &Element) -> Result<Self, DecodeError> {
        let kind = ReceiptKind::of(element).ok_or_else(|| DecodeError::UnexpectedElement {
            expected: "received or displayed",
            found: element.name().to_string(),
        })?;
        let id = match kind {
            ReceiptKind::Delivered => Received::try_from(element.clone())
                .map_err(|e| DecodeError::malformed("received", e))?
                .id,
            ReceiptKind::Displayed => stanza::required_attr(element, "displayed", "id")?.to_string(),
        };
        Ok(Self { kind, id })
    }

    /// Find and decode the receipt payload of a message.
    pub fn from_message(message: &Element) -> Result<Self, DecodeError> {
        let child = message
            .children()
            .find(|child| ReceiptKind::of(child).is_some())
            .ok_or(DecodeError::MissingChild {
                element: "message",
                child: "received or displayed",
            })?;
        Self::from_element(child)
    }
}

/// XEP-0184 acknowledgement for `original`, when it asked for one.
///
/// Returns `None` if no receipt was requested or the message has no id to
/// acknowledge. Receipts are never produced for group messages.
pub fn delivery_ack(original: &ChatMessage) -> Option<Element> {
    if original.header.kind != MessageKind::Direct || !original.body.receipt_requested {
        return None;
    }
    let id = original.header.id.as_deref()?;

    let ack = compose::message(&stanza::new_id(), original.header.from.clone(), MessageKind::Direct)
        .with_payload(Received { id: id.to_string() });
    Some(ack.into())
}

/// XEP-0333 displayed marker for `original`.
///
/// Group messages are referenced by the stanza-id the room assigned; one set
/// by anyone else is not trusted.
pub fn read_marker(original: &ChatMessage) -> Result<Element, MessagingError> {
    let conversation = original.header.conversation();

    let id = match original.header.kind {
        MessageKind::Group => {
            let stanza_id = original
                .body
                .stanza_id
                .as_ref()
                .ok_or(MessagingError::MissingStanzaId)?;
            if stanza_id.by != conversation {
                return Err(MessagingError::StanzaIdNotFromRoom {
                    by: stanza_id.by.to_string(),
                    room: conversation.to_string(),
                });
            }
            stanza_id.id.clone()
        }
        MessageKind::Direct => original
            .header
            .id
            .clone()
            .ok_or(MessagingError::MissingMessageId)?,
    };

    // XEP-0333 has no typed payload in xmpp-parsers.
    let displayed = Element::builder("displayed", ns::CHAT_MARKERS)
        .attr(xml_ncname!("id").into(), id)
        .build();
    let mut marker = compose::message(&stanza::new_id(), conversation.into(), original.header.kind);
    marker.payloads.push(displayed);
    Ok(marker.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn message(xml: &str) -> ChatMessage {
        ChatMessage::from_element(&xml.parse().unwrap()).unwrap()
    }

    #[test]
    fn decodes_delivery_and_read_receipts() {
        let delivered: Element = "<message xmlns='jabber:client' type='chat' from='a@b/c'>\
                                  <received xmlns='urn:xmpp:receipts' id='m1'/></message>"
            .parse()
            .unwrap();
        assert_eq!(
            Receipt::from_message(&delivered).unwrap(),
            Receipt {
                kind: ReceiptKind::Delivered,
                id: "m1".to_string()
            }
        );

        let displayed: Element = "<displayed xmlns='urn:xmpp:chat-markers:0' id='m2'/>"
            .parse()
            .unwrap();
        assert_eq!(Receipt::from_element(&displayed).unwrap().kind, ReceiptKind::Displayed);
    }

    #[test]
    fn receipt_without_id_is_rejected() {
        let element: Element = "<received xmlns='urn:xmpp:receipts'/>".parse().unwrap();
        assert_matches!(
            Receipt::from_element(&element),
            Err(DecodeError::Malformed { element: "received", .. })
        );

        let element: Element = "<displayed xmlns='urn:xmpp:chat-markers:0'/>".parse().unwrap();
        assert_matches!(
            Receipt::from_element(&element),
            Err(DecodeError::MissingAttribute { attribute: "id", .. })
        );
    }

    #[test]
    fn ack_answers_requested_direct_receipt() {
        let original = message(
            "<message xmlns='jabber:client' type='chat' id='m1' from='alice@example.com/phone'>\
             <body>hi</body><request xmlns='urn:xmpp:receipts'/></message>",
        );
        let ack = delivery_ack(&original).unwrap();

        assert_eq!(ack.attr("to"), Some("alice@example.com/phone"));
        assert_eq!(ack.attr("type"), Some("chat"));
        let received = ack.get_child("received", ns::RECEIPTS).unwrap();
        assert_eq!(received.attr("id"), Some("m1"));
    }

    #[test]
    fn no_ack_without_request_or_for_groups() {
        let unrequested = message(
            "<message xmlns='jabber:client' type='chat' id='m1' from='a@example.com'>\
             <body>hi</body></message>",
        );
        assert!(delivery_ack(&unrequested).is_none());

        let group = message(
            "<message xmlns='jabber:client' type='groupchat' id='m1' from='r@muc/bob'>\
             <body>hi</body><request xmlns='urn:xmpp:receipts'/></message>",
        );
        assert!(delivery_ack(&group).is_none());
    }

    #[test]
    fn group_read_marker_uses_room_stanza_id() {
        let original = message(
            "<message xmlns='jabber:client' type='groupchat' id='m1' from='room@muc.example.com/bob'>\
             <body>hi</body><stanza-id xmlns='urn:xmpp:sid:0' id='s1' by='room@muc.example.com'/>\
             </message>",
        );
        let marker = read_marker(&original).unwrap();

        assert_eq!(marker.attr("to"), Some("room@muc.example.com"));
        assert_eq!(marker.attr("type"), Some("groupchat"));
        assert_eq!(
            marker.get_child("displayed", ns::CHAT_MARKERS).unwrap().attr("id"),
            Some("s1")
        );
    }

    #[test]
    fn group_read_marker_rejects_foreign_or_missing_stanza_id() {
        let foreign = message(
            "<message xmlns='jabber:client' type='groupchat' from='room@muc.example.com/bob'>\
             <body>hi</body><stanza-id xmlns='urn:xmpp:sid:0' id='s1' by='bob@example.com'/>\
             </message>",
        );
        assert_matches!(
            read_marker(&foreign),
            Err(MessagingError::StanzaIdNotFromRoom { .. })
        );

        let missing = message(
            "<message xmlns='jabber:client' type='groupchat' from='room@muc.example.com/bob'>\
             <body>hi</body></message>",
        );
        assert_matches!(read_marker(&missing), Err(MessagingError::MissingStanzaId));
    }

    #[test]
    fn group_read_marker_accepts_room_stanza_id_in_other_case() {
        let original = message(
            "<message xmlns='jabber:client' type='groupchat' from='room@muc.example.com/bob'>\
             <body>hi</body><stanza-id xmlns='urn:xmpp:sid:0' id='s1' by='ROOM@muc.Example.com'/>\
             </message>",
        );
        let marker = read_marker(&original).unwrap();
        assert_eq!(marker.attr("to"), Some("room@muc.example.com"));
    }

    #[test]
    fn direct_read_marker_uses_message_id() {
        let original = message(
            "<message xmlns='jabber:client' type='chat' id='m9' from='alice@example.com/phone'>\
             <body>hi</body></message>",
        );
        let marker = read_marker(&original).unwrap();
        assert_eq!(marker.attr("to"), Some("alice@example.com"));
        assert_eq!(
            marker.get_child("displayed", ns::CHAT_MARKERS).unwrap().attr("id"),
            Some("m9")
        );
    }
}
