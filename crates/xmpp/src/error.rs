use std::fmt::Display;
use std::time::Duration;

use xmpp_parsers::minidom::Element;
use xmpp_parsers::stanza_error::StanzaError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum XmppError {
    #[error("failed to send stanza: {0}")]
    Send(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no response to {id} after {}s", .after.as_secs())]
    Timeout { id: String, after: Duration },

    #[error("exchange {0} is already pending")]
    DuplicateExchange(String),

    #[error("remote returned {condition}")]
    StanzaError {
        condition: String,
        text: Option<String>,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl XmppError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<&StanzaError> for XmppError {
    fn from(error: &StanzaError) -> Self {
        let condition = Element::from(error.defined_condition.clone())
            .name()
            .to_string();
        let text = error
            .texts
            .get("")
            .or_else(|| error.texts.values().next())
            .cloned();
        Self::StanzaError { condition, text }
    }
}

/// A payload could not be turned into the shape its handler expects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("<{element}/> is missing attribute '{attribute}'")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("<{element}/> is missing child <{child}/>")]
    MissingChild {
        element: &'static str,
        child: &'static str,
    },

    #[error("expected <{expected}/>, got <{found}/>")]
    UnexpectedElement {
        expected: &'static str,
        found: String,
    },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("malformed <{element}/>: {reason}")]
    Malformed {
        element: &'static str,
        reason: String,
    },
}

impl DecodeError {
    /// Wrap a typed parser failure.
    pub fn malformed(element: &'static str, reason: impl Display) -> Self {
        Self::Malformed {
            element,
            reason: reason.to_string(),
        }
    }
}

/// Anomalies seen while routing a response to its pending exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("no pending exchange for {0}")]
    UnknownExchange(String),

    #[error("exchange {0} was already delivered")]
    AlreadyDelivered(String),

    #[error("waiter for {0} went away before delivery")]
    Abandoned(String),
}

impl CorrelationError {
    /// A second delivery to one identifier points at a bug, not at the network.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::AlreadyDelivered(_))
    }
}
