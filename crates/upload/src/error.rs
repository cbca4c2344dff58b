use oasis_xmpp::{DecodeError, XmppError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UploadError {
    #[error("invalid upload: {0}")]
    Validation(String),

    #[error("no upload service discovered")]
    ServiceUnavailable,

    #[error("file of {size} bytes exceeds the service limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("slot negotiation failed: {0}")]
    Xmpp(#[from] XmppError),

    #[error("malformed upload slot: {0}")]
    MalformedSlot(#[from] DecodeError),

    #[error("transfer failed: {0}")]
    Transfer(String),

    #[error("upload rejected with HTTP status {0}")]
    Status(u16),

    #[error("upload cancelled")]
    Cancelled,

    #[error("cannot read upload source: {0}")]
    Io(String),
}
