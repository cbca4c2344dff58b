use std::future::Future;
use std::sync::Arc;

use crate::error::XmppError;
use crate::stanza::Element;

/// Outbound half of the stream.
///
/// `send` acknowledges local transmission only. Implementations encode the
/// element and write it to the wire; the inbound half calls back into the
/// session for every received stanza.
pub trait StanzaTransport: Send + Sync + 'static {
    fn send(&self, stanza: Element) -> impl Future<Output = Result<(), XmppError>> + Send;
}

impl<T: StanzaTransport> StanzaTransport for Arc<T> {
    fn send(&self, stanza: Element) -> impl Future<Output = Result<(), XmppError>> + Send {
        (**self).send(stanza)
    }
}
