use oasis_core::ConfigError;
use oasis_messaging::MessagingError;
use oasis_presence::PresenceError;
use oasis_rooms::RoomError;
use oasis_upload::UploadError;
use oasis_xmpp::{DecodeError, MessageKind, XmppError};

use crate::dispatcher::{HandlerKey, PayloadKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler can be registered for {payload:?} in {kind:?} messages")]
    UnsupportedKey {
        kind: MessageKind,
        payload: PayloadKind,
    },

    #[error("handler for {key:?} must be a {expected} handler")]
    HandlerMismatch {
        key: HandlerKey,
        expected: &'static str,
    },

    #[error("failed to decode payload: {0}")]
    Decode(#[from] DecodeError),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build HTTP client: {0}")]
    Http(String),

    #[error(transparent)]
    Xmpp(#[from] XmppError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}
