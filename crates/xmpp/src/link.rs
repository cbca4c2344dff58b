use std::time::Duration;

use tracing::debug;

use crate::correlator::Correlator;
use crate::error::{DecodeError, XmppError};
use crate::stanza::{self, Element, Iq, IqType, Jid};
use crate::transport::StanzaTransport;

/// Transport plus correlator: everything outbound goes through here.
pub struct StanzaLink<T: StanzaTransport> {
    transport: T,
    correlator: Correlator,
}

impl<T: StanzaTransport> StanzaLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            correlator: Correlator::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Fire-and-forget send.
    pub async fn send(&self, stanza: Element) -> Result<(), XmppError> {
        self.transport.send(stanza).await
    }

    /// Send an IQ and wait for its `result` or `error`.
    ///
    /// The exchange is registered before the IQ leaves, so an immediate answer
    /// can never beat the registration. Resolves to the result's payload.
    pub async fn query(
        &self,
        to: Option<&Jid>,
        iq_type: IqType,
        payload: Element,
        timeout: Duration,
    ) -> Result<Option<Element>, XmppError> {
        let exchange = self.correlator.begin();
        let request = stanza::request(exchange.id(), iq_type, to, payload);
        debug!(id = %exchange.id(), to = ?to.map(Jid::as_str), iq_type = iq_type.as_str(), "sending query");

        self.transport.send(request.into()).await?;
        let response = exchange.wait(timeout).await?;

        match Iq::try_from(response).map_err(|e| DecodeError::malformed("iq", e))? {
            Iq::Result { payload, .. } => Ok(payload),
            Iq::Error { error, .. } => Err(XmppError::from(&error)),
            Iq::Get { .. } | Iq::Set { .. } => Err(DecodeError::UnexpectedElement {
                expected: "iq type='result'",
                found: "iq request".to_string(),
            }
            .into()),
        }
    }

    /// Send `stanza` and wait for the inbound stanza resolved under `key`.
    ///
    /// Used for handshakes that are not IQs, such as MUC presence, where the
    /// routing layer knows which inbound stanza answers which key.
    pub async fn exchange(
        &self,
        key: &str,
        stanza: Element,
        timeout: Duration,
    ) -> Result<Element, XmppError> {
        let exchange = self.correlator.begin_with(key)?;
        self.transport.send(stanza).await?;
        exchange.wait(timeout).await
    }
}
