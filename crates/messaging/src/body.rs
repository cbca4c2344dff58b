use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use oasis_xmpp::stanza::{BareJid, Element, Jid, ns};
use tracing::debug;
use xmpp_parsers::delay::Delay;
use xmpp_parsers::stanza_id;

use crate::chat_state::ChatState;

/// XEP-0359 identifier assigned by an archiving entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StanzaId {
    pub id: String,
    pub by: Jid,
}

/// XEP-0461 reference to the message being answered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyRef {
    pub id: Option<String>,
    pub to: Option<String>,
}

/// XEP-0428 marker for a body range that only exists for legacy clients.
///
/// Offsets are kept as received; they are only checked against the body when
/// the reply is extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackSpan {
    /// Namespace of the feature the fallback stands in for
    pub scope: String,
    pub start: Option<usize>,
    pub end: Option<usize>,
}

/// Body with the reply fallback separated out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyParts {
    pub cleaned_body: Option<String>,
    pub reply_fallback_text: Option<String>,
}

/// Payload of a chat or groupchat message.
#[derive(Debug, Clone, Default)]
pub struct ChatMessageBody {
    pub body: Option<String>,
    pub origin_id: Option<String>,
    pub stanza_id: Option<StanzaId>,
    pub reply: Option<ReplyRef>,
    pub fallbacks: Vec<FallbackSpan>,
    pub receipt_requested: bool,
    pub markable: bool,
    pub chat_state: Option<ChatState>,
    /// XEP-0203 timestamp of the original send, for archived or offline messages
    pub delay: Option<DateTime<Utc>>,
    derived: OnceLock<ReplyParts>,
}

impl PartialEq for ChatMessageBody {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
            && self.origin_id == other.origin_id
            && self.stanza_id == other.stanza_id
            && self.reply == other.reply
            && self.fallbacks == other.fallbacks
            && self.receipt_requested == other.receipt_requested
            && self.markable == other.markable
            && self.chat_state == other.chat_state
            && self.delay == other.delay
    }
}

impl ChatMessageBody {
    /// Plain text body without any extensions.
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }

    /// Collect the payload children of a `<message/>`.
    ///
    /// Unrecognised or undecodable children are skipped, and malformed
    /// offsets are kept as `None` rather than failing the whole message.
    pub fn from_element(message: &Element) -> Self {
        let mut body = Self::default();

        for child in message.children() {
            match (child.ns().as_str(), child.name()) {
                (ns::JABBER_CLIENT, "body") if body.body.is_none() => {
                    body.body = Some(child.text());
                }
                (ns::SID, "origin-id") => match stanza_id::OriginId::try_from(child.clone()) {
                    Ok(origin) => body.origin_id = Some(origin.id),
                    Err(e) => debug!(error = %e, "skipping malformed origin-id"),
                },
                (ns::SID, "stanza-id") => match stanza_id::StanzaId::try_from(child.clone()) {
                    Ok(sid) => {
                        body.stanza_id = Some(StanzaId {
                            id: sid.id,
                            by: sid.by,
                        });
                    }
                    Err(e) => debug!(error = %e, "skipping malformed stanza-id"),
                },
                (ns::REPLY, "reply") => {
                    body.reply = Some(ReplyRef {
                        id: child.attr("id").map(str::to_string),
                        to: child.attr("to").map(str::to_string),
                    });
                }
                (ns::FALLBACK, "fallback") => {
                    body.fallbacks.push(decode_fallback(child));
                }
                (ns::RECEIPTS, "request") => body.receipt_requested = true,
                (ns::CHAT_MARKERS, "markable") => body.markable = true,
                (ns::CHATSTATES, _) => body.chat_state = ChatState::from_element(child),
                (ns::DELAY, "delay") => match Delay::try_from(child.clone()) {
                    Ok(delay) => body.delay = Some(delay.stamp.0.with_timezone(&Utc)),
                    Err(e) => debug!(error = %e, "skipping malformed delay"),
                },
                _ => {}
            }
        }

        body
    }

    /// Split the reply fallback from the body.
    ///
    /// Computed once per message; later calls return the cached result.
    pub fn parse_reply(&self) -> &ReplyParts {
        self.derived.get_or_init(|| extract_reply(self))
    }

    pub fn cleaned_body(&self) -> Option<&str> {
        self.parse_reply().cleaned_body.as_deref()
    }

    pub fn reply_fallback_text(&self) -> Option<&str> {
        self.parse_reply().reply_fallback_text.as_deref()
    }

    /// Identifier a reply to this message should reference, given the room
    /// it arrived in (for group messages).
    pub fn reply_target_id(&self, room: Option<&BareJid>) -> Option<&str> {
        match room {
            Some(room) => self
                .stanza_id
                .as_ref()
                .filter(|sid| sid.by == *room)
                .map(|sid| sid.id.as_str()),
            None => self.origin_id.as_deref(),
        }
    }
}

fn decode_fallback(element: &Element) -> FallbackSpan {
    let range = element.get_child("body", ns::FALLBACK);
    let offset = |name: &str| {
        range
            .and_then(|range| range.attr(name))
            .and_then(|value| value.parse::<usize>().ok())
    };

    FallbackSpan {
        scope: element.attr("for").unwrap_or_default().to_string(),
        start: offset("start"),
        end: offset("end"),
    }
}

fn extract_reply(message: &ChatMessageBody) -> ReplyParts {
    let verbatim = ReplyParts {
        cleaned_body: message.body.clone(),
        reply_fallback_text: None,
    };

    let Some(reply) = &message.reply else {
        return verbatim;
    };
    let unaddressed = |endpoint: &Option<String>| endpoint.as_deref().is_none_or(str::is_empty);
    if unaddressed(&reply.id) || unaddressed(&reply.to) {
        return verbatim;
    }
    let Some(span) = message.fallbacks.iter().find(|span| span.scope == ns::REPLY) else {
        return verbatim;
    };
    let Some(text) = message.body.as_deref() else {
        return verbatim;
    };

    let (Some(start), Some(end)) = (span.start, span.end) else {
        debug!(?span, "reply fallback without usable offsets, keeping body");
        return verbatim;
    };

    // `get` yields None for reversed ranges and for offsets off a char boundary.
    match (text.get(..start), text.get(start..end), text.get(end..)) {
        (Some(head), Some(quoted), Some(tail)) => ReplyParts {
            cleaned_body: Some(format!("{head}{tail}")),
            reply_fallback_text: Some(quoted.to_string()),
        },
        _ => {
            debug!(start, end, len = text.len(), "reply fallback out of bounds, keeping body");
            verbatim
        }
    }
}
