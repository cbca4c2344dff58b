//! XEP-0363 HTTP File Upload.
//!
//! An upload negotiates a single-use slot over XMPP, then streams the file to
//! the slot's PUT URL while reporting progress on a caller-supplied channel.

pub mod disco;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod slot;

pub use disco::UploadService;
pub use error::UploadError;
pub use pipeline::{SlotNegotiator, UploadJob, UploadPipeline, UploadSource};
pub use progress::{ProgressSink, UploadProgress, UploadStatus};
pub use slot::{SlotRequest, UploadSlot};
