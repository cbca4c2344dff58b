//! Outbound message builders.

use chrono::{DateTime, Utc};
use oasis_xmpp::stanza::{self, Element, Jid, MessageKind, ns, xml_ncname};
use xmpp_parsers::message::{Id, Lang, Message, MessageType};
use xmpp_parsers::stanza_id::OriginId;

use crate::chat_state::ChatState;
use crate::error::MessagingError;
use crate::message::ChatMessage;

/// Plain text message with a fresh id mirrored as origin-id.
pub fn text(to: &str, kind: MessageKind, body: &str) -> Result<Element, MessagingError> {
    if body.trim().is_empty() {
        return Err(MessagingError::EmptyBody);
    }
    let to = stanza::parse_jid("to", to)?;
    let id = stanza::new_id();
    Ok(message(&id, to, kind)
        .with_body(Lang::new(), body.to_string())
        .with_payload(OriginId { id })
        .into())
}

/// Standalone chat state notification.
pub fn chat_state(to: &str, kind: MessageKind, state: ChatState) -> Result<Element, MessagingError> {
    let to = stanza::parse_jid("to", to)?;
    Ok(message(&stanza::new_id(), to, kind)
        .with_payload(xmpp_parsers::chatstates::ChatState::from(state))
        .into())
}

/// Answer `original` with `body`, quoting the cleaned original text as a
/// legacy fallback.
///
/// When the original carries no usable reference id the quote is still sent,
/// just without reply metadata.
pub fn reply(
    original: &ChatMessage,
    body: &str,
    now: DateTime<Utc>,
) -> Result<Element, MessagingError> {
    if body.trim().is_empty() {
        return Err(MessagingError::EmptyBody);
    }

    let conversation = original.header.conversation();
    let kind = original.header.kind;
    let quote = quote_header(original, now);
    let full_text = format!("{quote}{body}");

    let id = stanza::new_id();
    let mut message = message(&id, conversation.clone().into(), kind)
        .with_body(Lang::new(), full_text)
        .with_payload(OriginId { id });

    if let Some(reference) = original.reference_id() {
        let addressed = match kind {
            MessageKind::Direct => conversation.as_str(),
            MessageKind::Group => original.header.from.as_str(),
        };
        message.payloads.push(reply_reference(reference, addressed));
        message.payloads.push(reply_fallback(quote.len()));
    }

    Ok(message.into())
}

/// XEP-0461 `<reply/>` pointing at the answered message.
fn reply_reference(id: &str, to: &str) -> Element {
    Element::builder("reply", ns::REPLY)
        .attr(xml_ncname!("id").into(), id)
        .attr(xml_ncname!("to").into(), to)
        .build()
}

/// XEP-0428 marker for the quoted prefix of the body.
fn reply_fallback(end: usize) -> Element {
    let range = Element::builder("body", ns::FALLBACK)
        .attr(xml_ncname!("start").into(), "0")
        .attr(xml_ncname!("end").into(), end.to_string())
        .build();
    Element::builder("fallback", ns::FALLBACK)
        .attr(xml_ncname!("for").into(), ns::REPLY)
        .append(range)
        .build()
}

/// `"{who} | {ago}\n"` followed by every original line prefixed with `"> "`.
fn quote_header(original: &ChatMessage, now: DateTime<Utc>) -> String {
    let who = match original.header.kind {
        MessageKind::Direct => original.header.conversation().to_string(),
        MessageKind::Group => original.header.nick().unwrap_or_default().to_string(),
    };
    let ago = original
        .body
        .delay
        .map(|sent| humanize_age(now, sent))
        .unwrap_or_default();

    let mut quote = format!("{who} | {ago}\n");
    for line in original.cleaned_body().unwrap_or_default().lines() {
        quote.push_str("> ");
        quote.push_str(line);
        quote.push('\n');
    }
    quote
}

fn humanize_age(now: DateTime<Utc>, sent: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(sent);
    if elapsed.num_minutes() < 1 {
        "just now".to_string()
    } else if elapsed.num_hours() < 1 {
        format!("{}m ago", elapsed.num_minutes())
    } else if elapsed.num_days() < 1 {
        format!("{}h ago", elapsed.num_hours())
    } else {
        format!("{}d ago", elapsed.num_days())
    }
}

pub(crate) fn message(id: &str, to: Jid, kind: MessageKind) -> Message {
    let type_ = match kind {
        MessageKind::Direct => MessageType::Chat,
        MessageKind::Group => MessageType::Groupchat,
    };
    let mut message = Message::new_with_type(type_, Some(to));
    message.id = Some(Id(id.to_string()));
    message
}
