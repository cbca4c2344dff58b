//! Local mirrors of remote room state.
//!
//! [`BookmarkManager`] keeps the XEP-0402 bookmark set, [`RoomRegistry`] the
//! rooms this session has joined. Both are read through copies and never hold
//! their lock across a network call.

pub mod bookmarks;
pub mod codec;
pub mod error;
pub mod membership;

pub use bookmarks::{Bookmark, BookmarkManager, BookmarkPush, BookmarkStore, BookmarkSubscriber};
pub use error::RoomError;
pub use membership::{HistoryOptions, JoinRequest, RoomHandle, RoomRegistry, RoomService};
