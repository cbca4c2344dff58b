//! Transport seam, request/response correlation, and stanza helpers.
//!
//! The stream itself (framing, TLS, SASL, resource binding) lives outside this
//! crate. The session only needs something that implements
//! [`StanzaTransport`] and a way to hand inbound elements back to it.

pub mod correlator;
pub mod error;
pub mod link;
pub mod stanza;
pub mod transport;

pub use correlator::{Correlator, PendingExchange};
pub use error::{CorrelationError, DecodeError, XmppError};
pub use link::StanzaLink;
pub use stanza::{BareJid, Element, FullJid, Iq, IqType, Jid, MessageKind};
pub use transport::StanzaTransport;
