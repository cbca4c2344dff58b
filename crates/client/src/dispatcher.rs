//! Typed handler registry for inbound message payloads.
//!
//! Handlers are keyed by conversation kind and payload kind. Each dispatched
//! stanza runs its handler as a separate task, so a slow handler never holds
//! up routing of the next stanza.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use oasis_messaging::{ChatMessage, ChatState, MessageHeader, Receipt, receipts};
use oasis_presence::PresenceEvent;
use oasis_rooms::{RoomHandle, RoomRegistry};
use oasis_xmpp::stanza::{Element, MessageKind, ns};
use tracing::{debug, info};

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Body,
    ChatState(ChatState),
    DeliveryReceipt,
    ReadReceipt,
}

impl PayloadKind {
    /// Payload kind of one message child, if it is one we route on.
    pub fn classify(child: &Element) -> Option<Self> {
        if child.is("body", ns::JABBER_CLIENT) {
            Some(Self::Body)
        } else if child.is("received", ns::RECEIPTS) {
            Some(Self::DeliveryReceipt)
        } else if child.is("displayed", ns::CHAT_MARKERS) {
            Some(Self::ReadReceipt)
        } else {
            ChatState::from_element(child).map(Self::ChatState)
        }
    }
}

/// Conversation kind and payload kind a handler is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    kind: MessageKind,
    payload: PayloadKind,
}

impl HandlerKey {
    /// Delivery receipts only exist in direct chats.
    pub fn new(kind: MessageKind, payload: PayloadKind) -> Result<Self, DispatchError> {
        if kind == MessageKind::Group && payload == PayloadKind::DeliveryReceipt {
            return Err(DispatchError::UnsupportedKey { kind, payload });
        }
        Ok(Self { kind, payload })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> PayloadKind {
        self.payload
    }

    /// Every valid key, direct chats first.
    pub fn all() -> Vec<Self> {
        let mut payloads = vec![PayloadKind::Body];
        payloads.extend(ChatState::ALL.into_iter().map(PayloadKind::ChatState));
        payloads.push(PayloadKind::DeliveryReceipt);
        payloads.push(PayloadKind::ReadReceipt);

        [MessageKind::Direct, MessageKind::Group]
            .into_iter()
            .flat_map(|kind| payloads.iter().map(move |payload| (kind, *payload)))
            .filter_map(|(kind, payload)| Self::new(kind, payload).ok())
            .collect()
    }

    fn expected_shape(&self) -> &'static str {
        match (self.kind, self.payload) {
            (MessageKind::Direct, PayloadKind::Body) => "message",
            (MessageKind::Group, PayloadKind::Body) => "group message",
            (_, PayloadKind::ChatState(_)) => "chat state",
            (_, PayloadKind::DeliveryReceipt | PayloadKind::ReadReceipt) => "receipt",
        }
    }
}

pub type Callback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Group chat message together with the room it arrived in, if joined.
#[derive(Debug, Clone)]
pub struct GroupMessage {
    pub room: Option<Arc<RoomHandle>>,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatStateEvent {
    pub header: MessageHeader,
    pub state: ChatState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptEvent {
    pub header: MessageHeader,
    pub receipt: Receipt,
}

#[derive(Clone)]
pub enum Handler {
    Message(Callback<ChatMessage>),
    GroupMessage(Callback<GroupMessage>),
    ChatState(Callback<ChatStateEvent>),
    Receipt(Callback<ReceiptEvent>),
}

impl Handler {
    fn shape(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::GroupMessage(_) => "group message",
            Self::ChatState(_) => "chat state",
            Self::Receipt(_) => "receipt",
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{}", self.shape())
    }
}

/// Result of dispatching one stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Unhandled,
    /// The handler task was started. `delivery_ack` is the receipt the sender
    /// asked for, still to be sent.
    Spawned { delivery_ack: Option<Element> },
}

fn callback<T, F, Fut>(f: F) -> Callback<T>
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |value| f(value).boxed())
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<HandlerKey, Handler>>,
    presence: RwLock<Option<Callback<PresenceEvent>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `key`, returning the handler it replaces.
    pub fn register(
        &self,
        key: HandlerKey,
        handler: Handler,
    ) -> Result<Option<Handler>, DispatchError> {
        if handler.shape() != key.expected_shape() {
            return Err(DispatchError::HandlerMismatch {
                key,
                expected: key.expected_shape(),
            });
        }

        let previous = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, handler);
        if previous.is_some() {
            info!(?key, "handler replaced");
        }
        Ok(previous)
    }

    pub fn unregister(&self, key: &HandlerKey) -> Option<Handler> {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn is_registered(&self, key: &HandlerKey) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn handler(&self, key: &HandlerKey) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn install(&self, key: HandlerKey, handler: Handler) -> Option<Handler> {
        self.register(key, handler).ok().flatten()
    }

    pub fn on_direct_message<F, Fut>(&self, f: F) -> Option<Handler>
    where
        F: Fn(ChatMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = HandlerKey {
            kind: MessageKind::Direct,
            payload: PayloadKind::Body,
        };
        self.install(key, Handler::Message(callback(f)))
    }

    pub fn on_group_message<F, Fut>(&self, f: F) -> Option<Handler>
    where
        F: Fn(GroupMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = HandlerKey {
            kind: MessageKind::Group,
            payload: PayloadKind::Body,
        };
        self.install(key, Handler::GroupMessage(callback(f)))
    }

    /// Register `f` for all five chat states of `kind`. Returns how many
    /// handlers were replaced.
    pub fn on_chat_state<F, Fut>(&self, kind: MessageKind, f: F) -> usize
    where
        F: Fn(ChatStateEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = callback(f);
        ChatState::ALL
            .into_iter()
            .filter_map(|state| {
                let key = HandlerKey {
                    kind,
                    payload: PayloadKind::ChatState(state),
                };
                self.install(key, Handler::ChatState(Arc::clone(&shared)))
            })
            .count()
    }

    pub fn on_delivery_receipt<F, Fut>(&self, f: F) -> Option<Handler>
    where
        F: Fn(ReceiptEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = HandlerKey {
            kind: MessageKind::Direct,
            payload: PayloadKind::DeliveryReceipt,
        };
        self.install(key, Handler::Receipt(callback(f)))
    }

    pub fn on_read_receipt<F, Fut>(&self, kind: MessageKind, f: F) -> Option<Handler>
    where
        F: Fn(ReceiptEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = HandlerKey {
            kind,
            payload: PayloadKind::ReadReceipt,
        };
        self.install(key, Handler::Receipt(callback(f)))
    }

    pub fn on_presence<F, Fut>(&self, f: F) -> bool
    where
        F: Fn(PresenceEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let replaced = self
            .presence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(callback(f))
            .is_some();
        if replaced {
            info!("presence handler replaced");
        }
        replaced
    }

    /// Hand `event` to the presence handler. Returns false if there is none.
    pub fn dispatch_presence(&self, event: PresenceEvent) -> bool {
        let handler = self
            .presence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => {
                tokio::spawn(handler(event));
                true
            }
            None => false,
        }
    }

    /// Route a chat or groupchat message to the handler of its first
    /// registered payload child, in document order.
    pub fn route(&self, message: &Element, rooms: &RoomRegistry) -> Result<Dispatched, DispatchError> {
        let Some(kind) = MessageKind::from_type_attr(message.attr("type")) else {
            return Ok(Dispatched::Unhandled);
        };

        let key = message
            .children()
            .filter_map(PayloadKind::classify)
            .filter_map(|payload| HandlerKey::new(kind, payload).ok())
            .find(|key| self.is_registered(key));

        match key {
            Some(key) => self.dispatch(key, message, rooms),
            None => {
                debug!(kind = kind.as_str(), "no handler for message payloads");
                Ok(Dispatched::Unhandled)
            }
        }
    }

    /// Decode `message` into the shape registered for `key` and start the
    /// handler. Never waits for the handler to finish.
    pub fn dispatch(
        &self,
        key: HandlerKey,
        message: &Element,
        rooms: &RoomRegistry,
    ) -> Result<Dispatched, DispatchError> {
        let Some(handler) = self.handler(&key) else {
            return Ok(Dispatched::Unhandled);
        };

        let mut delivery_ack = None;
        match handler {
            Handler::Message(f) => {
                let message = ChatMessage::from_element(message)?;
                delivery_ack = receipts::delivery_ack(&message);
                tokio::spawn(f(message));
            }
            Handler::GroupMessage(f) => {
                let message = ChatMessage::from_element(message)?;
                let room = rooms.get(message.header.conversation().as_str());
                tokio::spawn(f(GroupMessage { room, message }));
            }
            Handler::ChatState(f) => {
                let header = MessageHeader::from_element(message)?;
                let PayloadKind::ChatState(state) = key.payload else {
                    return Err(DispatchError::HandlerMismatch {
                        key,
                        expected: key.expected_shape(),
                    });
                };
                tokio::spawn(f(ChatStateEvent { header, state }));
            }
            Handler::Receipt(f) => {
                let header = MessageHeader::from_element(message)?;
                let receipt = Receipt::from_message(message)?;
                tokio::spawn(f(ReceiptEvent { header, receipt }));
            }
        }

        debug!(?key, "handler started");
        Ok(Dispatched::Spawned { delivery_ack })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn parse(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out")
            .expect("handler dropped its sender")
    }

    #[test]
    fn group_delivery_receipt_key_is_rejected() {
        assert_matches!(
            HandlerKey::new(MessageKind::Group, PayloadKind::DeliveryReceipt),
            Err(DispatchError::UnsupportedKey { .. })
        );
        assert!(HandlerKey::new(MessageKind::Group, PayloadKind::ReadReceipt).is_ok());
    }

    #[test]
    fn all_keys_cover_both_kinds() {
        let keys = HandlerKey::all();
        // 8 payload kinds for direct chats, 7 for group chats
        assert_eq!(keys.len(), 15);
        assert!(keys.iter().all(|key| !(key.kind() == MessageKind::Group
            && key.payload() == PayloadKind::DeliveryReceipt)));
    }

    #[test]
    fn mismatched_handler_shape_is_refused() {
        let registry = HandlerRegistry::new();
        let key = HandlerKey::new(MessageKind::Direct, PayloadKind::Body).unwrap();
        let wrong = Handler::Receipt(callback(|_: ReceiptEvent| async {}));

        assert_matches!(
            registry.register(key, wrong),
            Err(DispatchError::HandlerMismatch { expected: "message", .. })
        );
        assert!(!registry.is_registered(&key));
    }

    #[tokio::test]
    async fn registering_twice_replaces_and_returns_previous() {
        let registry = HandlerRegistry::new();
        assert!(registry.on_direct_message(|_| async {}).is_none());
        assert!(registry.on_direct_message(|_| async {}).is_some());

        let key = HandlerKey::new(MessageKind::Direct, PayloadKind::Body).unwrap();
        assert!(registry.unregister(&key).is_some());
        assert!(!registry.is_registered(&key));
    }

    #[tokio::test]
    async fn direct_message_with_receipt_request_yields_ack() {
        let registry = HandlerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on_direct_message(move |message: ChatMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        });

        let stanza = parse(
            "<message xmlns='jabber:client' type='chat' id='m1' from='alice@example.com/phone'>\
             <body>hi</body><request xmlns='urn:xmpp:receipts'/></message>",
        );
        let outcome = registry.route(&stanza, &RoomRegistry::new()).unwrap();

        let ack = assert_matches!(outcome, Dispatched::Spawned { delivery_ack: Some(ack) } => ack);
        assert_eq!(ack.attr("to"), Some("alice@example.com/phone"));
        assert_eq!(ack.get_child("received", ns::RECEIPTS).unwrap().attr("id"), Some("m1"));
        assert_eq!(recv(&mut rx).await.cleaned_body(), Some("hi"));
    }

    #[tokio::test]
    async fn first_registered_child_wins() {
        let registry = HandlerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let states = tx.clone();
        registry.on_chat_state(MessageKind::Direct, move |event: ChatStateEvent| {
            let tx = states.clone();
            async move {
                let _ = tx.send(format!("state:{}", event.state.as_str()));
            }
        });
        registry.on_direct_message(move |_| {
            let tx = tx.clone();
            async move {
                let _ = tx.send("body".to_string());
            }
        });

        let stanza = parse(
            "<message xmlns='jabber:client' type='chat' from='alice@example.com/phone'>\
             <composing xmlns='http://jabber.org/protocol/chatstates'/><body>hi</body></message>",
        );
        registry.route(&stanza, &RoomRegistry::new()).unwrap();

        assert_eq!(recv(&mut rx).await, "state:composing");
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregistered_payloads_fall_through_to_later_children() {
        let registry = HandlerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on_direct_message(move |message: ChatMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.header.id);
            }
        });

        let stanza = parse(
            "<message xmlns='jabber:client' type='chat' id='m2' from='alice@example.com/phone'>\
             <active xmlns='http://jabber.org/protocol/chatstates'/><body>hi</body></message>",
        );
        assert_matches!(
            registry.route(&stanza, &RoomRegistry::new()),
            Ok(Dispatched::Spawned { delivery_ack: None })
        );
        assert_eq!(recv(&mut rx).await.as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn group_message_carries_joined_room() {
        let registry = HandlerRegistry::new();
        let rooms = RoomRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on_group_message(move |event: GroupMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        });

        struct Joined;
        impl oasis_rooms::RoomService for Joined {
            async fn join(
                &self,
                request: &oasis_rooms::JoinRequest,
            ) -> Result<RoomHandle, oasis_rooms::RoomError> {
                Ok(RoomHandle {
                    room: request.room.clone(),
                    nick: request.nick.clone(),
                    joined_at: Utc::now(),
                })
            }

            async fn leave(
                &self,
                _handle: &RoomHandle,
                _reason: Option<&str>,
            ) -> Result<(), oasis_rooms::RoomError> {
                Ok(())
            }
        }
        rooms
            .join(
                &Joined,
                &oasis_rooms::Bookmark::new("lobby@muc.example.com", "oasis"),
                oasis_rooms::HistoryOptions::default(),
            )
            .await
            .unwrap();

        let stanza = parse(
            "<message xmlns='jabber:client' type='groupchat' from='lobby@muc.example.com/bob'>\
             <body>hello room</body></message>",
        );
        registry.route(&stanza, &rooms).unwrap();

        let event = recv(&mut rx).await;
        assert_eq!(event.room.unwrap().nick, "oasis");
        assert_eq!(event.message.header.nick(), Some("bob"));
    }

    #[tokio::test]
    async fn read_receipts_are_decoded() {
        let registry = HandlerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on_read_receipt(MessageKind::Group, move |event: ReceiptEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.receipt);
            }
        });

        let stanza = parse(
            "<message xmlns='jabber:client' type='groupchat' from='lobby@muc.example.com/bob'>\
             <displayed xmlns='urn:xmpp:chat-markers:0' id='s-9'/></message>",
        );
        registry.route(&stanza, &RoomRegistry::new()).unwrap();

        let receipt = recv(&mut rx).await;
        assert_eq!(receipt.id, "s-9");
    }

    #[tokio::test]
    async fn malformed_payload_is_a_decode_error() {
        let registry = HandlerRegistry::new();
        registry.on_delivery_receipt(|_| async {});

        let stanza = parse(
            "<message xmlns='jabber:client' type='chat' from='alice@example.com/phone'>\
             <received xmlns='urn:xmpp:receipts'/></message>",
        );
        assert_matches!(
            registry.route(&stanza, &RoomRegistry::new()),
            Err(DispatchError::Decode(_))
        );
    }

    #[tokio::test]
    async fn missing_handler_or_type_is_unhandled() {
        let registry = HandlerRegistry::new();
        let rooms = RoomRegistry::new();

        let chat = parse(
            "<message xmlns='jabber:client' type='chat' from='a@b/c'><body>x</body></message>",
        );
        assert_eq!(registry.route(&chat, &rooms).unwrap(), Dispatched::Unhandled);

        registry.on_direct_message(|_| async {});
        let headline = parse(
            "<message xmlns='jabber:client' type='headline' from='a@b'><body>x</body></message>",
        );
        assert_eq!(registry.route(&headline, &rooms).unwrap(), Dispatched::Unhandled);
    }

    #[tokio::test]
    async fn slow_handler_does_not_block_dispatch() {
        let registry = HandlerRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.on_direct_message(move |message: ChatMessage| {
            let tx = tx.clone();
            async move {
                if message.cleaned_body() == Some("slow") {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                let _ = tx.send(message.cleaned_body().map(str::to_string));
            }
        });

        let rooms = RoomRegistry::new();
        for body in ["slow", "fast"] {
            let stanza = parse(&format!(
                "<message xmlns='jabber:client' type='chat' from='a@b/c'><body>{body}</body></message>"
            ));
            registry.route(&stanza, &rooms).unwrap();
        }

        assert_eq!(recv(&mut rx).await.as_deref(), Some("fast"));
    }

    #[tokio::test]
    async fn presence_handler_receives_events() {
        let registry = HandlerRegistry::new();
        let event = PresenceEvent::from_element(&parse(
            "<presence xmlns='jabber:client' from='alice@example.com/desktop'/>",
        ))
        .unwrap();
        assert!(!registry.dispatch_presence(event.clone()));

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!registry.on_presence(move |event: PresenceEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event);
            }
        }));
        assert!(registry.dispatch_presence(event.clone()));
        assert_eq!(recv(&mut rx).await, event);
    }
}
