//! The session object tying the Oasis crates together.
//!
//! A [`Session`] is fed every inbound stanza through
//! [`Session::handle_stanza`] and owns all per-account state. Typed message
//! handlers are registered on its [`HandlerRegistry`].

pub mod dispatcher;
pub mod error;
pub mod session;
pub mod stores;

pub use dispatcher::{
    Callback, ChatStateEvent, Dispatched, GroupMessage, Handler, HandlerKey, HandlerRegistry,
    PayloadKind, ReceiptEvent,
};
pub use error::{ClientError, DispatchError};
pub use session::{AutojoinReport, Routed, Session};
pub use stores::{XmppBookmarkStore, XmppRoomService};
