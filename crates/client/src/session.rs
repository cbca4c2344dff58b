use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use futures::future;
use oasis_core::SessionConfig;
use oasis_messaging::{ChatMessage, ChatState, compose, receipts};
use oasis_presence::{PresenceEvent, PresenceInfo, PresenceShow, PresenceTracker};
use oasis_rooms::codec as rooms_codec;
use oasis_rooms::{Bookmark, BookmarkManager, HistoryOptions, RoomError, RoomHandle, RoomRegistry};
use oasis_upload::{UploadError, UploadJob, UploadPipeline, UploadProgress, UploadService, disco};
use oasis_xmpp::stanza::{self, BareJid, Element, Iq, IqType, Jid, MessageKind, ns};
use oasis_xmpp::{StanzaLink, StanzaTransport, XmppError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType};

use crate::dispatcher::{Dispatched, HandlerRegistry};
use crate::error::{ClientError, DispatchError};
use crate::stores::{XmppBookmarkStore, XmppRoomService, join_key, leave_key};

/// What [`Session::handle_stanza`] did with an inbound stanza.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Delivered to a pending query
    Response,
    /// An inbound IQ request was answered
    Answered,
    /// Delivered to a pending MUC join or leave
    RoomExchange,
    /// Recorded and, if a handler exists, handed to it
    Presence { handled: bool },
    /// Bookmark changes pushed by the server
    BookmarkPush(usize),
    Message(Dispatched),
    Dropped,
}

/// Rooms entered by [`Session::join_autojoin_rooms`].
#[derive(Debug, Default)]
pub struct AutojoinReport {
    pub joined: Vec<Arc<RoomHandle>>,
    pub failed: Vec<(String, RoomError)>,
}

/// One logged-in account.
///
/// Owns the per-session state: handlers, correlator, bookmark and room
/// caches, presence map and the discovered upload service. Every cache has its
/// own lock and none is held across a network call.
pub struct Session<T: StanzaTransport> {
    config: SessionConfig,
    account: BareJid,
    link: Arc<StanzaLink<T>>,
    handlers: HandlerRegistry,
    bookmarks: Arc<BookmarkManager<XmppBookmarkStore<T>>>,
    rooms: RoomRegistry,
    room_service: XmppRoomService<T>,
    presence: PresenceTracker,
    upload_service: RwLock<Option<UploadService>>,
    uploads: UploadPipeline,
}

impl<T: StanzaTransport> Session<T> {
    pub fn new(config: SessionConfig, transport: T) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Self::with_http_client(config, transport, http)
    }

    pub fn with_http_client(
        config: SessionConfig,
        transport: T,
        http: reqwest::Client,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let account = config.account()?;

        let link = Arc::new(StanzaLink::new(transport));
        let timeouts = &config.timeouts;
        let bookmarks = BookmarkManager::new(XmppBookmarkStore::new(Arc::clone(&link), timeouts.query()));
        let room_service = XmppRoomService::new(Arc::clone(&link), timeouts.room());
        let uploads = UploadPipeline::new(http, config.upload.chunk_size, timeouts.upload_slot());

        Ok(Self {
            account,
            link,
            handlers: HandlerRegistry::new(),
            bookmarks: Arc::new(bookmarks),
            rooms: RoomRegistry::new(),
            room_service,
            presence: PresenceTracker::new(),
            upload_service: RwLock::new(None),
            uploads,
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn account(&self) -> &BareJid {
        &self.account
    }

    pub fn link(&self) -> &Arc<StanzaLink<T>> {
        &self.link
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn bookmarks(&self) -> &BookmarkManager<XmppBookmarkStore<T>> {
        &self.bookmarks
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Route one inbound stanza.
    ///
    /// Called by the transport's read loop for every stanza it receives.
    pub async fn handle_stanza(&self, stanza: &Element) -> Result<Routed, ClientError> {
        match stanza.name() {
            "iq" => self.handle_iq(stanza).await,
            "presence" => self.handle_presence(stanza),
            "message" => self.handle_message(stanza),
            other => {
                debug!(name = %other, "dropping unknown stanza");
                Ok(Routed::Dropped)
            }
        }
    }

    async fn handle_iq(&self, stanza: &Element) -> Result<Routed, ClientError> {
        let iq = match Iq::try_from(stanza.clone()) {
            Ok(iq) => iq,
            Err(e) => {
                debug!(id = ?stanza.attr("id"), error = %e, "dropping undecodable iq");
                return Ok(Routed::Dropped);
            }
        };
        let id = iq.id();

        match &iq {
            Iq::Result { .. } | Iq::Error { .. } => {
                if let Err(e) = self.link.correlator().resolve(id, stanza.clone()) {
                    if e.is_defect() {
                        warn!(id = %id, error = %e, "response delivered twice");
                    } else {
                        debug!(id = %id, error = %e, "unmatched response");
                    }
                }
                Ok(Routed::Response)
            }
            Iq::Get { payload, .. } | Iq::Set { payload, .. } => {
                let answer = if payload.is("ping", ns::PING) {
                    stanza::iq_result(&iq)
                } else {
                    debug!(id = %id, "no service for inbound request");
                    stanza::iq_error(&iq, ErrorType::Cancel, DefinedCondition::ServiceUnavailable)
                };
                self.link.send(answer.into()).await?;
                Ok(Routed::Answered)
            }
        }
    }

    fn handle_presence(&self, presence: &Element) -> Result<Routed, ClientError> {
        let from = presence.attr("from").and_then(|from| from.parse::<Jid>().ok());
        if let Some(from) = from {
            let correlator = self.link.correlator();
            let unavailable = presence.attr("type") == Some("unavailable");
            let key = if unavailable && correlator.is_pending(&leave_key(&from)) {
                Some(leave_key(&from))
            } else if !unavailable && correlator.is_pending(&join_key(&from)) {
                Some(join_key(&from))
            } else {
                None
            };
            if let Some(key) = key {
                if let Err(e) = correlator.resolve(&key, presence.clone()) {
                    debug!(key = %key, error = %e, "room presence arrived too late");
                }
                return Ok(Routed::RoomExchange);
            }
        }

        let event = PresenceEvent::from_element(presence).map_err(DispatchError::from)?;
        self.presence.apply(&event);
        let handled = self.handlers.dispatch_presence(event);
        Ok(Routed::Presence { handled })
    }

    /// Whether a stanza claims to come from the account itself. A missing
    /// `from` means the server on the account's behalf.
    fn from_account(&self, stanza: &Element) -> bool {
        match stanza.attr("from") {
            None => true,
            Some(from) => from
                .parse::<Jid>()
                .is_ok_and(|from| from.to_bare() == self.account),
        }
    }

    fn handle_message(&self, message: &Element) -> Result<Routed, ClientError> {
        if let Some(pushes) = rooms_codec::decode_push(message) {
            if !self.from_account(message) {
                warn!(from = ?message.attr("from"), "ignoring bookmark push from a foreign entity");
                return Ok(Routed::Dropped);
            }

            let pushes = pushes.map_err(DispatchError::from)?;
            let count = pushes.len();
            for push in pushes {
                self.bookmarks.apply_push(push);
            }
            return Ok(Routed::BookmarkPush(count));
        }

        if MessageKind::from_type_attr(message.attr("type")).is_none() {
            debug!(kind = ?message.attr("type"), "dropping message of unrouted type");
            return Ok(Routed::Dropped);
        }

        let dispatched = self.handlers.route(message, &self.rooms)?;
        if let Dispatched::Spawned {
            delivery_ack: Some(ack),
        } = &dispatched
        {
            let link = Arc::clone(&self.link);
            let ack = ack.clone();
            tokio::spawn(async move {
                if let Err(e) = link.send(ack).await {
                    warn!(error = %e, "failed to send delivery receipt");
                }
            });
        }
        Ok(Routed::Message(dispatched))
    }

    /// Send a chat message and return its id.
    pub async fn send_text(&self, to: &str, body: &str) -> Result<String, ClientError> {
        let message = compose::text(to, MessageKind::Direct, body)?;
        self.send_message(message).await
    }

    /// Send to a joined room.
    pub async fn send_group_text(&self, room: &str, body: &str) -> Result<String, ClientError> {
        if self.rooms.get(room).is_none() {
            return Err(RoomError::RoomNotFound(room.to_string()).into());
        }
        let message = compose::text(room, MessageKind::Group, body)?;
        self.send_message(message).await
    }

    pub async fn reply_to(&self, original: &ChatMessage, body: &str) -> Result<String, ClientError> {
        let message = compose::reply(original, body, Utc::now())?;
        self.send_message(message).await
    }

    pub async fn mark_as_read(&self, original: &ChatMessage) -> Result<(), ClientError> {
        let marker = receipts::read_marker(original)?;
        self.link.send(marker).await?;
        Ok(())
    }

    pub async fn send_chat_state(
        &self,
        to: &str,
        kind: MessageKind,
        state: ChatState,
    ) -> Result<(), ClientError> {
        self.link.send(compose::chat_state(to, kind, state)?).await?;
        Ok(())
    }

    async fn send_message(&self, message: Element) -> Result<String, ClientError> {
        let id = message.attr("id").unwrap_or_default().to_string();
        self.link.send(message).await?;
        debug!(id = %id, "message sent");
        Ok(id)
    }

    pub async fn send_presence(
        &self,
        show: &PresenceShow,
        status: Option<&str>,
        priority: i16,
    ) -> Result<(), ClientError> {
        let presence = oasis_presence::own_presence(show, status, priority)?;
        self.link.send(presence).await?;
        Ok(())
    }

    pub fn presence_of(&self, jid: &str) -> PresenceInfo {
        self.presence.get_presence(jid)
    }

    /// IQ round trip bounded by the configured query timeout.
    pub async fn send_query(
        &self,
        to: Option<&Jid>,
        iq_type: IqType,
        payload: Element,
    ) -> Result<Option<Element>, XmppError> {
        self.link
            .query(to, iq_type, payload, self.config.timeouts.query())
            .await
    }

    /// Look for an HTTP upload component under the account and its server,
    /// and cache it.
    pub async fn discover_upload_service(&self) -> Result<Option<UploadService>, ClientError> {
        let server = BareJid::from_parts(None, self.account.domain());
        let roots = [Jid::from(self.account.clone()), Jid::from(server)];
        let found = disco::discover(&*self.link, &roots, self.config.timeouts.query()).await?;
        if found.is_none() {
            info!(server = %roots[1], "no upload service found");
        }
        *self
            .upload_service
            .write()
            .unwrap_or_else(PoisonError::into_inner) = found.clone();
        Ok(found)
    }

    pub fn upload_service(&self) -> Option<UploadService> {
        self.upload_service
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Channel sized for one upload's progress events.
    pub fn progress_channel(&self) -> (mpsc::Sender<UploadProgress>, mpsc::Receiver<UploadProgress>) {
        mpsc::channel(self.config.upload.progress_buffer.max(1))
    }

    /// Upload through the discovered service; fails with
    /// [`UploadError::ServiceUnavailable`] before discovery.
    pub async fn upload(
        &self,
        job: UploadJob,
        progress: Option<mpsc::Sender<UploadProgress>>,
        cancel: CancellationToken,
    ) -> Result<String, UploadError> {
        let service = self.upload_service();
        self.uploads
            .upload(&*self.link, service.as_ref(), job, progress, cancel)
            .await
    }

    /// Install the bookmark subscriber.
    ///
    /// With `re_emit`, or while the cache is still empty, the bookmark set is
    /// fetched again in the background so the new subscriber sees every entry.
    pub fn set_bookmark_handler<F>(&self, re_emit: bool, f: F) -> Option<JoinHandle<()>>
    where
        F: Fn(Bookmark) + Send + Sync + 'static,
    {
        self.bookmarks.set_subscriber(Arc::new(f));
        if !re_emit && !self.bookmarks.is_empty() {
            return None;
        }

        let bookmarks = Arc::clone(&self.bookmarks);
        Some(tokio::spawn(async move {
            if let Err(e) = bookmarks.refresh().await {
                warn!(error = %e, "bookmark refresh failed");
            }
        }))
    }

    pub async fn refresh_bookmarks(&self) -> Result<usize, RoomError> {
        self.bookmarks.refresh().await
    }

    pub async fn publish_bookmark(&self, bookmark: Bookmark) -> Result<(), RoomError> {
        self.bookmarks.publish(bookmark).await
    }

    pub async fn delete_bookmark(&self, room: &str) -> Result<(), RoomError> {
        self.bookmarks.delete(room).await
    }

    pub async fn toggle_autojoin(&self, room: &str, autojoin: bool) -> Result<(), RoomError> {
        self.bookmarks.toggle_autojoin(room, autojoin).await
    }

    pub async fn join_room(
        &self,
        bookmark: &Bookmark,
        history: HistoryOptions,
    ) -> Result<Arc<RoomHandle>, RoomError> {
        self.rooms.join(&self.room_service, bookmark, history).await
    }

    pub async fn leave_room(&self, room: &str, reason: Option<&str>) -> Result<(), RoomError> {
        self.rooms.leave(&self.room_service, room, reason).await
    }

    /// Publish `bookmark` with autojoin set, then join. Both outcomes are
    /// returned; the join is attempted even if publishing failed.
    pub async fn join_and_remember(
        &self,
        bookmark: Bookmark,
        history: HistoryOptions,
    ) -> (Result<(), RoomError>, Result<Arc<RoomHandle>, RoomError>) {
        let bookmark = bookmark.with_autojoin(true);
        let published = self.bookmarks.publish(bookmark.clone()).await;
        if let Err(e) = &published {
            warn!(room = %bookmark.room, error = %e, "failed to remember room");
        }
        let joined = self.join_room(&bookmark, history).await;
        (published, joined)
    }

    /// Clear the autojoin flag, then leave. Both outcomes are returned.
    pub async fn leave_and_forget(
        &self,
        room: &str,
        reason: Option<&str>,
    ) -> (Result<(), RoomError>, Result<(), RoomError>) {
        let forgotten = self.bookmarks.toggle_autojoin(room, false).await;
        if let Err(e) = &forgotten {
            warn!(room = %room, error = %e, "failed to clear autojoin");
        }
        let left = self.leave_room(room, reason).await;
        (forgotten, left)
    }

    /// Join every autojoin bookmark plus the configured rooms, concurrently.
    pub async fn join_autojoin_rooms(&self, history: HistoryOptions) -> AutojoinReport {
        let mut targets: Vec<Bookmark> = self
            .bookmarks
            .snapshot()
            .into_values()
            .filter(|bookmark| bookmark.autojoin)
            .collect();
        for room in &self.config.rooms {
            if !targets.iter().any(|bookmark| &bookmark.room == room) {
                targets.push(Bookmark::new(room.as_str(), self.config.display_name.as_str()));
            }
        }
        targets.retain(|bookmark| self.rooms.get(&bookmark.room).is_none());
        targets.sort_by(|a, b| a.room.cmp(&b.room));

        let attempts = targets.iter().map(|bookmark| async move {
            (bookmark.room.clone(), self.join_room(bookmark, history).await)
        });

        let mut report = AutojoinReport::default();
        for (room, outcome) in future::join_all(attempts).await {
            match outcome {
                Ok(handle) => report.joined.push(handle),
                Err(e) => {
                    warn!(room = %room, error = %e, "autojoin failed");
                    report.failed.push((room, e));
                }
            }
        }
        info!(joined = report.joined.len(), failed = report.failed.len(), "autojoin finished");
        report
    }

    /// Drop state tied to the stream after it went away.
    pub fn connection_lost(&self) {
        let cancelled = self.link.correlator().cancel_all();
        let rooms = self.rooms.clear();
        self.presence.clear();
        info!(cancelled, rooms, "session state reset after connection loss");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use oasis_xmpp::Correlator;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    /// Records outbound stanzas. IQs are answered through `reply`, MUC joins
    /// by feeding our own presence back through the session.
    struct Wire {
        correlator: Mutex<Option<Correlator>>,
        sent: Mutex<Vec<Element>>,
        reply: fn(&Element) -> Option<Element>,
    }

    impl StanzaTransport for Wire {
        async fn send(&self, stanza: Element) -> Result<(), XmppError> {
            let answer = (self.reply)(&stanza);
            self.sent.lock().unwrap().push(stanza);
            if let Some(answer) = answer {
                let id = answer.attr("id").unwrap_or_default().to_string();
                if let Some(correlator) = self.correlator.lock().unwrap().as_ref() {
                    let _ = correlator.resolve(&id, answer);
                }
            }
            Ok(())
        }
    }

    fn session(reply: fn(&Element) -> Option<Element>) -> (Session<Arc<Wire>>, Arc<Wire>) {
        session_for("bot@example.com", reply)
    }

    fn session_for(
        account: &str,
        reply: fn(&Element) -> Option<Element>,
    ) -> (Session<Arc<Wire>>, Arc<Wire>) {
        let wire = Arc::new(Wire {
            correlator: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            reply,
        });
        let mut config = SessionConfig::new(account);
        config.display_name = "Oasis".to_string();
        config.rooms = vec!["config@muc.example.com".to_string()];
        config.timeouts.room_seconds = 1;
        let session = Session::new(config, Arc::clone(&wire)).unwrap();
        *wire.correlator.lock().unwrap() = Some(session.link().correlator().clone());
        (session, wire)
    }

    fn silent(_: &Element) -> Option<Element> {
        None
    }

    fn iq_ok(stanza: &Element) -> Option<Element> {
        if stanza.name() != "iq" {
            return None;
        }
        Some(
            format!(
                "<iq xmlns='jabber:client' type='result' id='{}'/>",
                stanza.attr("id").unwrap_or_default()
            )
            .parse()
            .unwrap(),
        )
    }

    fn parse(xml: &str) -> Element {
        xml.parse().unwrap()
    }

    fn self_presence(occupant: &str) -> Element {
        parse(&format!(
            "<presence xmlns='jabber:client' from='{occupant}'>\
             <x xmlns='http://jabber.org/protocol/muc#user'><status code='110'/></x></presence>"
        ))
    }

    /// Wait until a stanza matching `pred` is on the wire.
    async fn sent_matching(wire: &Wire, pred: impl Fn(&Element) -> bool) -> Element {
        for _ in 0..100 {
            if let Some(found) = wire.sent.lock().unwrap().iter().find(|s| pred(s)).cloned() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected stanza was never sent");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let wire = Arc::new(Wire {
            correlator: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            reply: silent,
        });
        let result = Session::new(SessionConfig::new(""), wire);
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[tokio::test]
    async fn ping_is_answered_and_other_requests_refused() {
        let (session, wire) = session(silent);

        let ping = parse(
            "<iq xmlns='jabber:client' type='get' id='p1' from='example.com'>\
             <ping xmlns='urn:xmpp:ping'/></iq>",
        );
        assert_eq!(session.handle_stanza(&ping).await.unwrap(), Routed::Answered);

        let version = parse(
            "<iq xmlns='jabber:client' type='get' id='v1' from='example.com'>\
             <query xmlns='jabber:iq:version'/></iq>",
        );
        session.handle_stanza(&version).await.unwrap();

        let sent = wire.sent.lock().unwrap();
        assert_eq!(sent[0].attr("type"), Some("result"));
        assert_eq!(sent[0].attr("id"), Some("p1"));
        assert_eq!(sent[1].attr("type"), Some("error"));
        assert_matches!(
            stanza::stanza_error(&sent[1]),
            Some(XmppError::StanzaError { condition, .. }) if condition == "service-unavailable"
        );
    }

    #[traced_test]
    #[tokio::test]
    async fn unmatched_response_is_logged_and_dropped() {
        let (session, _wire) = session(silent);
        let stray = parse("<iq xmlns='jabber:client' type='result' id='nobody'/>");

        assert_eq!(session.handle_stanza(&stray).await.unwrap(), Routed::Response);
        assert!(logs_contain("unmatched response"));
    }

    #[tokio::test]
    async fn inbound_response_resolves_query() {
        let (session, wire) = session(silent);
        let session = Arc::new(session);

        let querying = Arc::clone(&session);
        let query = tokio::spawn(async move {
            querying
                .send_query(
                    Some(&Jid::new("example.com").unwrap()),
                    IqType::Get,
                    Element::builder("ping", ns::PING).build(),
                )
                .await
        });

        let sent = sent_matching(&wire, |s| s.name() == "iq").await;
        assert_eq!(sent.attr("to"), Some("example.com"));
        let id = sent.attr("id").unwrap();
        let response = parse(&format!(
            "<iq xmlns='jabber:client' type='result' id='{id}'><pong xmlns='urn:example'/></iq>"
        ));
        assert_eq!(session.handle_stanza(&response).await.unwrap(), Routed::Response);

        let payload = query.await.unwrap().unwrap();
        assert_eq!(payload.map(|p| p.name().to_string()), Some("pong".to_string()));
    }

    #[tokio::test]
    async fn iq_without_client_namespace_is_dropped() {
        let (session, wire) = session(silent);
        let stray = parse(
            "<iq xmlns='jabber:component:accept' type='get' id='c1'><ping xmlns='urn:xmpp:ping'/></iq>",
        );

        assert_eq!(session.handle_stanza(&stray).await.unwrap(), Routed::Dropped);
        assert!(wire.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn direct_message_with_receipt_request_is_acknowledged() {
        let (session, wire) = session(silent);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.handlers().on_direct_message(move |message: ChatMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
        });

        let inbound = parse(
            "<message xmlns='jabber:client' type='chat' id='m1' from='alice@example.com/phone'>\
             <body>hello</body><request xmlns='urn:xmpp:receipts'/></message>",
        );
        assert_matches!(
            session.handle_stanza(&inbound).await.unwrap(),
            Routed::Message(Dispatched::Spawned { delivery_ack: Some(_) })
        );

        let message = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.cleaned_body(), Some("hello"));

        let ack = sent_matching(&wire, |s| s.get_child("received", ns::RECEIPTS).is_some()).await;
        assert_eq!(ack.attr("to"), Some("alice@example.com/phone"));
    }

    #[tokio::test]
    async fn message_without_handler_is_unhandled() {
        let (session, wire) = session(silent);
        let inbound = parse(
            "<message xmlns='jabber:client' type='chat' id='m1' from='alice@example.com/phone'>\
             <body>hello</body><request xmlns='urn:xmpp:receipts'/></message>",
        );
        assert_eq!(
            session.handle_stanza(&inbound).await.unwrap(),
            Routed::Message(Dispatched::Unhandled)
        );
        tokio::task::yield_now().await;
        assert!(wire.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn bookmark_push_updates_cache_and_subscriber() {
        let (session, _wire) = session(silent);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.bookmarks().set_subscriber(Arc::new(move |bookmark: Bookmark| {
            let _ = tx.send(bookmark);
        }));

        let push = parse(
            "<message xmlns='jabber:client' from='bot@example.com' type='headline'>\
             <event xmlns='http://jabber.org/protocol/pubsub#event'>\
             <items node='urn:xmpp:bookmarks:1'>\
             <item id='lobby@muc.example.com'>\
             <conference xmlns='urn:xmpp:bookmarks:1' autojoin='true'><nick>oasis</nick></conference>\
             </item></items></event></message>",
        );
        assert_eq!(session.handle_stanza(&push).await.unwrap(), Routed::BookmarkPush(1));
        assert!(session.bookmarks().get("lobby@muc.example.com").unwrap().autojoin);
        assert_eq!(rx.recv().await.unwrap().room, "lobby@muc.example.com");

        let foreign = parse(
            "<message xmlns='jabber:client' from='mallory@evil.example' type='headline'>\
             <event xmlns='http://jabber.org/protocol/pubsub#event'>\
             <items node='urn:xmpp:bookmarks:1'><retract id='lobby@muc.example.com'/></items>\
             </event></message>",
        );
        assert_eq!(session.handle_stanza(&foreign).await.unwrap(), Routed::Dropped);
        assert!(session.bookmarks().get("lobby@muc.example.com").is_some());
    }

    fn bookmark_push(from: &str) -> Element {
        parse(&format!(
            "<message xmlns='jabber:client' from='{from}' type='headline'>\
             <event xmlns='http://jabber.org/protocol/pubsub#event'>\
             <items node='urn:xmpp:bookmarks:1'>\
             <item id='lobby@muc.example.com'>\
             <conference xmlns='urn:xmpp:bookmarks:1'><nick>oasis</nick></conference>\
             </item></items></event></message>"
        ))
    }

    #[tokio::test]
    async fn bookmark_push_matches_account_case_insensitively() {
        let (session, _wire) = session_for("Bot@Example.com", silent);

        let push = bookmark_push("bot@example.com/phone");
        assert_eq!(session.handle_stanza(&push).await.unwrap(), Routed::BookmarkPush(1));
        assert!(session.bookmarks().get("lobby@muc.example.com").is_some());

        let other_domain = bookmark_push("bot@example.com.evil.example");
        assert_eq!(session.handle_stanza(&other_domain).await.unwrap(), Routed::Dropped);
    }

    #[tokio::test]
    async fn join_resolves_from_routed_presence_and_leave_clears_handle() {
        let (session, wire) = session(silent);
        let session = Arc::new(session);

        let joining = Arc::clone(&session);
        let join = tokio::spawn(async move {
            joining
                .join_room(&Bookmark::new("lobby@muc.example.com", "oasis"), HistoryOptions::none())
                .await
        });

        sent_matching(&wire, |s| s.name() == "presence").await;
        let own = self_presence("lobby@muc.example.com/oasis");
        assert_eq!(session.handle_stanza(&own).await.unwrap(), Routed::RoomExchange);
        let handle = join.await.unwrap().unwrap();
        assert_eq!(handle.nick, "oasis");
        assert!(session.rooms().get("lobby@muc.example.com").is_some());

        let leaving = Arc::clone(&session);
        let leave = tokio::spawn(async move { leaving.leave_room("lobby@muc.example.com", None).await });
        sent_matching(&wire, |s| s.attr("type") == Some("unavailable")).await;
        let gone = parse(
            "<presence xmlns='jabber:client' type='unavailable' from='lobby@muc.example.com/oasis'/>",
        );
        assert_eq!(session.handle_stanza(&gone).await.unwrap(), Routed::RoomExchange);
        leave.await.unwrap().unwrap();
        assert!(session.rooms().get("lobby@muc.example.com").is_none());
    }

    #[tokio::test]
    async fn mixed_case_room_join_resolves_from_normalized_presence() {
        let (session, wire) = session(silent);
        let session = Arc::new(session);

        let joining = Arc::clone(&session);
        let join = tokio::spawn(async move {
            joining
                .join_room(&Bookmark::new("Lobby@MUC.example.com", "Oasis"), HistoryOptions::none())
                .await
        });

        let sent = sent_matching(&wire, |s| s.name() == "presence").await;
        assert_eq!(sent.attr("to"), Some("lobby@muc.example.com/Oasis"));
        let own = self_presence("LOBBY@muc.example.com/Oasis");
        assert_eq!(session.handle_stanza(&own).await.unwrap(), Routed::RoomExchange);
        join.await.unwrap().unwrap();
        assert!(session.rooms().get("lobby@muc.example.com").is_some());
    }

    #[tokio::test]
    async fn other_presence_reaches_tracker_and_handler() {
        let (session, _wire) = session(silent);
        let presence = parse(
            "<presence xmlns='jabber:client' from='alice@example.com/desktop'><show>away</show></presence>",
        );
        assert_eq!(
            session.handle_stanza(&presence).await.unwrap(),
            Routed::Presence { handled: false }
        );
        assert_eq!(session.presence_of("alice@example.com").show, PresenceShow::Away);

        session.handlers().on_presence(|_| async {});
        assert_eq!(
            session.handle_stanza(&presence).await.unwrap(),
            Routed::Presence { handled: true }
        );
    }

    #[tokio::test]
    async fn group_text_requires_joined_room() {
        let (session, wire) = session(silent);
        assert_matches!(
            session.send_group_text("lobby@muc.example.com", "hi").await,
            Err(ClientError::Room(RoomError::RoomNotFound(_)))
        );
        assert!(wire.sent.lock().unwrap().is_empty());

        let id = session.send_text("alice@example.com", "hi").await.unwrap();
        assert_eq!(wire.sent.lock().unwrap()[0].attr("id"), Some(id.as_str()));
    }

    #[tokio::test]
    async fn upload_before_discovery_is_unavailable() {
        let (session, _wire) = session(silent);
        let result = session
            .upload(UploadJob::from_bytes("a.txt", &b"abc"[..]), None, CancellationToken::new())
            .await;
        assert_matches!(result, Err(UploadError::ServiceUnavailable));
    }

    #[tokio::test]
    async fn set_bookmark_handler_refreshes_when_cache_is_empty() {
        let (session, wire) = session(iq_ok);
        let refresh = session.set_bookmark_handler(false, |_: Bookmark| {});
        refresh.expect("empty cache triggers a refresh").await.unwrap();

        let sent = wire.sent.lock().unwrap();
        assert!(sent[0].get_child("pubsub", ns::PUBSUB).is_some());
    }

    #[tokio::test]
    async fn leave_and_forget_reports_both_outcomes() {
        let (session, _wire) = session(silent);
        let (forgotten, left) = session.leave_and_forget("lobby@muc.example.com", None).await;
        assert_matches!(forgotten, Err(RoomError::BookmarkNotFound(_)));
        assert_matches!(left, Err(RoomError::RoomNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn autojoin_collects_failures_per_room() {
        let (session, _wire) = session(iq_ok);
        session
            .publish_bookmark(Bookmark::new("lobby@muc.example.com", "oasis").with_autojoin(true))
            .await
            .unwrap();
        session
            .publish_bookmark(Bookmark::new("quiet@muc.example.com", "oasis"))
            .await
            .unwrap();

        // Nobody answers the joins, so both targets time out.
        let report = session.join_autojoin_rooms(HistoryOptions::default()).await;

        assert!(report.joined.is_empty());
        let failed: Vec<&str> = report.failed.iter().map(|(room, _)| room.as_str()).collect();
        assert_eq!(failed, vec!["config@muc.example.com", "lobby@muc.example.com"]);
        assert!(report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, RoomError::Xmpp(XmppError::Timeout { .. }))));
    }

    #[tokio::test]
    async fn connection_lost_resets_state() {
        let (session, _wire) = session(silent);
        let presence = parse("<presence xmlns='jabber:client' from='alice@example.com'/>");
        session.handle_stanza(&presence).await.unwrap();

        session.connection_lost();
        assert_eq!(session.presence_of("alice@example.com").show, PresenceShow::Unavailable);
        assert_eq!(session.link().correlator().pending_count(), 0);
    }
}
