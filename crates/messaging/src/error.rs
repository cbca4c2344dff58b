use oasis_xmpp::{DecodeError, XmppError};

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("message body must not be empty")]
    EmptyBody,

    #[error("original message carries no id")]
    MissingMessageId,

    #[error("group message carries no stanza-id")]
    MissingStanzaId,

    #[error("stanza-id was set by {by}, not by room {room}")]
    StanzaIdNotFromRoom { by: String, room: String },

    #[error("invalid address: {0}")]
    Address(#[from] DecodeError),

    #[error(transparent)]
    Xmpp(#[from] XmppError),
}
