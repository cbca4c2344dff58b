//! 1:1 and MUC message payloads.
//!
//! Decoding turns an inbound `<message/>` into [`ChatMessage`]; the reply
//! fallback is stripped once at decode time and cached on the body. The
//! `compose` and `receipts` modules build the outbound counterparts.

pub mod body;
pub mod chat_state;
pub mod compose;
pub mod error;
pub mod message;
pub mod receipts;

pub use body::{ChatMessageBody, FallbackSpan, ReplyParts, ReplyRef, StanzaId};
pub use chat_state::ChatState;
pub use error::MessagingError;
pub use message::{ChatMessage, MessageHeader};
pub use receipts::{Receipt, ReceiptKind};
