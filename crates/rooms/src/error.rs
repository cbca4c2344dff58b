use oasis_xmpp::{DecodeError, XmppError};

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("bookmark not found: {0}")]
    BookmarkNotFound(String),

    #[error("not joined to room: {0}")]
    RoomNotFound(String),

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("room {room} rejected the join: {condition}")]
    JoinRejected { room: String, condition: String },

    #[error(transparent)]
    Xmpp(#[from] XmppError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
