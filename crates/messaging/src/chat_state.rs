use oasis_xmpp::stanza::{Element, ns};
use xmpp_parsers::chatstates;

/// XEP-0085 Chat State Notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChatState {
    Active,
    Composing,
    Paused,
    Inactive,
    Gone,
}

impl ChatState {
    pub const ALL: [ChatState; 5] = [
        ChatState::Active,
        ChatState::Composing,
        ChatState::Paused,
        ChatState::Inactive,
        ChatState::Gone,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Composing => "composing",
            Self::Paused => "paused",
            Self::Inactive => "inactive",
            Self::Gone => "gone",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == name)
    }

    /// Chat state carried by a payload element, if it is one.
    pub fn from_element(element: &Element) -> Option<Self> {
        if element.ns() != ns::CHATSTATES {
            return None;
        }
        chatstates::ChatState::try_from(element.clone())
            .ok()
            .map(Self::from)
    }

    pub fn to_element(self) -> Element {
        chatstates::ChatState::from(self).into()
    }
}

impl From<chatstates::ChatState> for ChatState {
    fn from(state: chatstates::ChatState) -> Self {
        match state {
            chatstates::ChatState::Active => Self::Active,
            chatstates::ChatState::Composing => Self::Composing,
            chatstates::ChatState::Paused => Self::Paused,
            chatstates::ChatState::Inactive => Self::Inactive,
            chatstates::ChatState::Gone => Self::Gone,
        }
    }
}

impl From<ChatState> for chatstates::ChatState {
    fn from(state: ChatState) -> Self {
        match state {
            ChatState::Active => Self::Active,
            ChatState::Composing => Self::Composing,
            ChatState::Paused => Self::Paused,
            ChatState::Inactive => Self::Inactive,
            ChatState::Gone => Self::Gone,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for state in ChatState::ALL {
            assert_eq!(ChatState::from_name(state.as_str()), Some(state));
            assert_eq!(ChatState::from_element(&state.to_element()), Some(state));
        }
        assert_eq!(ChatState::from_name("typing"), None);
    }

    #[test]
    fn foreign_namespace_is_not_a_chat_state() {
        let element: Element = "<active xmlns='urn:example'/>".parse().unwrap();
        assert_eq!(ChatState::from_element(&element), None);
    }

    #[test]
    fn unknown_state_name_is_not_a_chat_state() {
        let element: Element = "<typing xmlns='http://jabber.org/protocol/chatstates'/>"
            .parse()
            .unwrap();
        assert_eq!(ChatState::from_element(&element), None);
    }
}
