//! Session state machine.
//!
//! A session owns the channel table of one BEEP connection and runs the
//! channel-zero management protocol: the greeting exchange, starting and
//! closing channels, closing the session, and tuning resets. It never
//! touches the byte stream itself; frames to write and requests for the
//! transport (stop or resume reading, perform a reset, shut down) leave
//! through a single ordered [`Outbound`] queue, and frames read by the
//! transport come in through [`Session::post_wire_frame`].
//!
//! Replies to our own channel-zero requests are applied on the transport
//! task as soon as they are complete, so a started channel is active before
//! the next frame is read.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::channel::{Channel, ChannelState, DEFAULT_WINDOW_SIZE};
use crate::config::SessionConfig;
use crate::control::{CloseRequest, ControlMessage, Greeting, ProfileElement, StartRequest};
use crate::error::{BeepError, Error, ProtocolError, ReplyCode, SessionError};
use crate::frame::{MessageType, WireFrame, MAX_NUMBER};
use crate::message::{split_entity, Message, PiggybackReply, ReplyListener, RequestHandler};
use crate::profile::ProfileRegistry;
use crate::tuning::{
    SessionCredential, TuneRequest, TuningHandshake, TuningOutcome, TuningProperties,
};

const EVENT_CAPACITY: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which end of the connection we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; starts odd-numbered channels
    Initiator,
    /// Accepted the connection; starts even-numbered channels
    Listener,
}

impl Role {
    fn first_channel(self) -> u32 {
        match self {
            Role::Initiator => 1,
            Role::Listener => 2,
        }
    }

    /// True if channel `number` is one we would allocate
    #[must_use]
    pub fn allocates(self, number: u32) -> bool {
        number % 2 == self.first_channel() % 2
    }
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Built, greeting not yet sent
    Initialized,
    /// Our greeting is out, waiting for the peer's
    GreetingSent,
    /// Greetings exchanged
    Active,
    /// A tuning profile has agreed to a reset; reading is paused
    TuningPending,
    /// The transport is running the tuning handshake
    Tuning,
    /// The peer asked to close the session
    ClosePending,
    /// We asked to close the session
    Closing,
    /// Closed in an orderly way (or replaced by a reset)
    Closed,
    /// Terminated on error
    Aborted,
}

impl SessionState {
    /// Check whether a transition is allowed
    #[must_use]
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;

        match (self, to) {
            (Closed | Aborted, _) => false,
            (_, Aborted) => true,
            (Initialized, GreetingSent | Closed) => true,
            (GreetingSent, Active | Closed) => true,
            (Active, TuningPending | ClosePending | Closing) => true,
            (TuningPending, Tuning | Active) => true,
            (Tuning, Closed) => true,
            (ClosePending, Closed | Active) => true,
            (Closing, Closed | Active) => true,
            _ => false,
        }
    }

    /// True if inbound frames are processed in this state
    #[must_use]
    pub fn accepts_frames(self) -> bool {
        matches!(
            self,
            SessionState::GreetingSent
                | SessionState::Active
                | SessionState::TuningPending
                | SessionState::Tuning
                | SessionState::Closing
        )
    }

    /// True once the session is closed or aborted
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Aborted)
    }
}

/// Notifications broadcast by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The peer's greeting arrived
    GreetingReceived {
        /// Profiles the peer advertised
        profiles: Vec<String>,
    },
    /// A channel became active
    ChannelStarted {
        /// Channel number
        number: u32,
        /// Negotiated profile
        profile: String,
    },
    /// A channel was closed
    ChannelClosed {
        /// Channel number
        number: u32,
    },
    /// The session closed in an orderly way
    Closed,
    /// The session was terminated on error
    Terminated {
        /// Why
        reason: String,
    },
    /// A tuning reset replaced the session
    Reset {
        /// Retired session
        old: SessionId,
        /// Session continuing the connection
        new: SessionId,
    },
}

/// Work for the transport, in the order it must be performed
#[derive(Debug)]
pub enum Outbound {
    /// Write a frame
    Frame(WireFrame),
    /// Resume (`true`) or pause (`false`) reading frames
    Ingest(bool),
    /// Flush, then run a tuning handshake on the raw stream
    Tune(TuneRequest),
    /// Flush, then close the connection
    Shutdown,
}

/// Builds a [`Session`] and the queue its transport drains
pub struct SessionBuilder {
    role: Role,
    config: SessionConfig,
    registry: ProfileRegistry,
    local_credential: Option<SessionCredential>,
    peer_credential: Option<SessionCredential>,
    properties: TuningProperties,
}

impl SessionBuilder {
    /// Builder with default configuration and no profiles
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            role,
            config: SessionConfig::default(),
            registry: ProfileRegistry::new(),
            local_credential: None,
            peer_credential: None,
            properties: TuningProperties::new(),
        }
    }

    /// Set the configuration
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the profiles this session offers and accepts
    #[must_use]
    pub fn registry(mut self, registry: ProfileRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set our credential
    #[must_use]
    pub fn local_credential(mut self, credential: Option<SessionCredential>) -> Self {
        self.local_credential = credential;
        self
    }

    /// Set the peer's credential
    #[must_use]
    pub fn peer_credential(mut self, credential: Option<SessionCredential>) -> Self {
        self.peer_credential = credential;
        self
    }

    /// Set the security properties already in force
    #[must_use]
    pub fn tuning_properties(mut self, properties: TuningProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Create the session
    #[must_use]
    pub fn build(self) -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Initialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let id = SessionId::next();
        let role = self.role;

        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let greeting = weak.clone();
            let (listener, _) = ControlReply::new(move |reply| {
                if let Some(inner) = greeting.upgrade() {
                    Session { inner }.complete_greeting(reply);
                }
                Ok(())
            });
            let zero = Channel::new_zero(&self.config, outbound.clone(), weak.clone(), listener);
            zero.set_request_handler(Arc::new(ControlHandler {
                session: weak.clone(),
            }));
            let channels = DashMap::new();
            channels.insert(0, zero);

            SessionInner {
                id,
                role,
                next_channel: Mutex::new(role.first_channel()),
                config: self.config,
                registry: self.registry,
                state: Mutex::new(SessionState::Initialized),
                state_tx,
                channels,
                outbound,
                events,
                local_credential: Mutex::new(self.local_credential),
                peer_credential: Mutex::new(self.peer_credential),
                properties: Mutex::new(self.properties),
                peer_greeting: Mutex::new(None),
                greeting_error: Mutex::new(None),
                termination: Mutex::new(None),
                server_name_sent: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
            }
        });

        tracing::debug!("Session {} created as {:?}", id, role);
        (Session { inner }, rx)
    }
}

pub(crate) struct SessionInner {
    id: SessionId,
    role: Role,
    config: SessionConfig,
    registry: ProfileRegistry,
    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,
    channels: DashMap<u32, Channel>,
    next_channel: Mutex<u32>,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<SessionEvent>,
    local_credential: Mutex<Option<SessionCredential>>,
    peer_credential: Mutex<Option<SessionCredential>>,
    properties: Mutex<TuningProperties>,
    peer_greeting: Mutex<Option<Greeting>>,
    greeting_error: Mutex<Option<BeepError>>,
    termination: Mutex<Option<String>>,
    server_name_sent: AtomicBool,
    handles: Mutex<Vec<Weak<RwLock<Session>>>>,
}

/// A BEEP session
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// Our role
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Profiles this session offers and accepts
    #[must_use]
    pub fn registry(&self) -> &ProfileRegistry {
        &self.inner.registry
    }

    /// Channel by number
    #[must_use]
    pub fn channel(&self, number: u32) -> Option<Channel> {
        self.inner.channels.get(&number).map(|c| c.value().clone())
    }

    /// Open channels, channel zero included, by number
    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .inner
            .channels
            .iter()
            .map(|c| c.value().clone())
            .collect();
        channels.sort_by_key(Channel::number);
        channels
    }

    /// The peer's greeting, once received
    #[must_use]
    pub fn peer_greeting(&self) -> Option<Greeting> {
        self.inner.peer_greeting.lock().clone()
    }

    /// Profiles the peer advertised
    #[must_use]
    pub fn peer_profiles(&self) -> Vec<String> {
        self.inner
            .peer_greeting
            .lock()
            .as_ref()
            .map(|g| g.profiles.clone())
            .unwrap_or_default()
    }

    /// Our credential
    #[must_use]
    pub fn local_credential(&self) -> Option<SessionCredential> {
        self.inner.local_credential.lock().clone()
    }

    /// The peer's credential
    #[must_use]
    pub fn peer_credential(&self) -> Option<SessionCredential> {
        self.inner.peer_credential.lock().clone()
    }

    /// Record our credential (for profiles that authenticate without a reset)
    pub fn set_local_credential(&self, credential: SessionCredential) {
        *self.inner.local_credential.lock() = Some(credential);
    }

    /// Record the peer's credential
    pub fn set_peer_credential(&self, credential: SessionCredential) {
        *self.inner.peer_credential.lock() = Some(credential);
    }

    /// Security properties in force
    #[must_use]
    pub fn tuning_properties(&self) -> TuningProperties {
        self.inner.properties.lock().clone()
    }

    /// Why the session was terminated, if it was
    #[must_use]
    pub fn termination_reason(&self) -> Option<String> {
        self.inner.termination.lock().clone()
    }

    /// Handle that keeps following the connection across tuning resets
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        let current = Arc::new(RwLock::new(self.clone()));
        self.inner.handles.lock().push(Arc::downgrade(&current));
        SessionHandle { current }
    }

    fn transition_to(&self, to: SessionState) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        let from = *state;
        if !from.can_transition(to) {
            return Err(SessionError::InvalidSessionTransition { from, to });
        }
        *state = to;
        self.inner.state_tx.send_replace(to);
        drop(state);

        tracing::debug!(
            "Session {} state transition: {:?} -> {:?}",
            self.inner.id,
            from,
            to
        );
        Ok(())
    }

    fn send(&self, outbound: Outbound) -> Result<(), SessionError> {
        self.inner
            .outbound
            .send(outbound)
            .map_err(|_| SessionError::TransportClosed)
    }

    /// Back to `Active` after an abandoned close
    fn resume_active(&self) {
        if let Err(e) = self.transition_to(SessionState::Active) {
            tracing::debug!("Session {} stays {:?}: {}", self.inner.id, self.state(), e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn channel_zero(&self) -> Result<Channel, SessionError> {
        self.channel(0)
            .ok_or_else(|| SessionError::InvalidState(self.state()))
    }

    fn take_channels(&self) -> Vec<Channel> {
        let channels: Vec<Channel> = self
            .inner
            .channels
            .iter()
            .map(|c| c.value().clone())
            .collect();
        self.inner.channels.clear();
        channels
    }

    fn new_channel(&self, number: u32) -> Channel {
        Channel::new(
            number,
            &self.inner.config,
            self.inner.outbound.clone(),
            Arc::downgrade(&self.inner),
        )
    }

    fn discard_channel(&self, channel: &Channel, reason: &str) {
        self.inner.channels.remove(&channel.number());
        channel.shutdown(ChannelState::Closed, reason);
    }

    fn apply_window(&self, channel: &Channel) {
        let window = self.inner.config.window_size;
        if window != DEFAULT_WINDOW_SIZE && self.state() == SessionState::Active {
            if let Err(e) = channel.set_receive_window(window) {
                tracing::debug!("Could not set window on channel {}: {}", channel.number(), e);
            }
        }
    }

    /// Reserve the next free channel number of our parity
    fn allocate_channel(&self) -> Result<Channel, SessionError> {
        let mut next = self.inner.next_channel.lock();
        let first = *next;
        loop {
            let number = *next;
            *next = match number.checked_add(2) {
                Some(n) if n <= MAX_NUMBER => n,
                _ => self.inner.role.first_channel(),
            };
            if !self.inner.channels.contains_key(&number) {
                let channel = self.new_channel(number);
                self.inner.channels.insert(number, channel.clone());
                return Ok(channel);
            }
            if *next == first {
                return Err(SessionError::InvalidState(self.state()));
            }
        }
    }

    /// Exchange greetings with the peer
    ///
    /// Sends our greeting, starts reading, then waits until the peer's
    /// greeting arrives or `greeting_timeout` passes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Beep` if the peer refused the session, and
    /// `SessionError::GreetingFailed` on timeout or a malformed greeting.
    /// The session is terminated in both cases.
    pub async fn init(&self) -> Result<(), Error> {
        let zero = self.channel_zero()?;
        let greeting = ControlMessage::Greeting(self.inner.registry.greeting(self));

        self.transition_to(SessionState::GreetingSent)?;
        zero.send_reply(0, MessageType::Rpy, greeting.to_payload())?;
        if self.inner.config.window_size != DEFAULT_WINDOW_SIZE {
            zero.set_receive_window(self.inner.config.window_size)?;
        }
        self.send(Outbound::Ingest(true))?;

        self.await_greeting().await
    }

    async fn await_greeting(&self) -> Result<(), Error> {
        let mut state_rx = self.watch_state();
        let deadline = Instant::now() + self.inner.config.greeting_timeout;
        let mut ticker = tokio::time::interval(self.inner.config.greeting_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SessionState::Initialized | SessionState::GreetingSent => {}
                SessionState::Closed | SessionState::Aborted => {
                    if let Some(error) = self.inner.greeting_error.lock().take() {
                        return Err(error.into());
                    }
                    let reason = self
                        .termination_reason()
                        .unwrap_or_else(|| "session ended".to_string());
                    return Err(SessionError::GreetingFailed(reason.into()).into());
                }
                _ => return Ok(()),
            }

            if Instant::now() >= deadline {
                self.terminate("timed out waiting for greeting");
                return Err(SessionError::GreetingFailed("timed out".into()).into());
            }
            tokio::select! {
                _ = state_rx.changed() => {}
                _ = ticker.tick() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    fn complete_greeting(&self, reply: Result<ControlMessage, Error>) {
        match reply {
            Ok(ControlMessage::Greeting(greeting)) => {
                let profiles = greeting.profiles.clone();
                *self.inner.peer_greeting.lock() = Some(greeting);
                if let Err(e) = self.transition_to(SessionState::Active) {
                    self.terminate(&format!("greeting in wrong state: {e}"));
                    return;
                }
                tracing::info!(
                    "Session {} greeting received, peer offers {:?}",
                    self.inner.id,
                    profiles
                );
                self.emit(SessionEvent::GreetingReceived { profiles });
            }
            Ok(ControlMessage::Error(error)) => {
                let reason = format!("peer refused the session: {error}");
                *self.inner.greeting_error.lock() = Some(error);
                self.terminate(&reason);
            }
            Ok(other) => {
                self.terminate(&format!("expected <greeting>, got <{}>", other.element_name()));
            }
            Err(e) => self.terminate(&format!("malformed greeting: {e}")),
        }
    }

    /// Start a channel with a single profile
    ///
    /// # Errors
    ///
    /// See [`start_channel_with`](Self::start_channel_with).
    pub async fn start_channel(
        &self,
        profile: &str,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Channel, Error> {
        self.start_channel_with(vec![ProfileElement::new(profile)], handler)
            .await
    }

    /// Ask the peer to start a channel with one of `profiles`
    ///
    /// `handler` receives MSGs on the new channel. On success the channel is
    /// active and carries the profile the peer picked, plus any piggybacked
    /// data it returned.
    ///
    /// # Errors
    ///
    /// Returns `Error::Beep` if the peer refused, and `SessionError` if the
    /// session is not active or ends first.
    pub async fn start_channel_with(
        &self,
        profiles: Vec<ProfileElement>,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<Channel, Error> {
        let state = self.state();
        if state != SessionState::Active {
            return Err(SessionError::InvalidState(state).into());
        }
        if profiles.is_empty() {
            return Err(SessionError::ProfileUnavailable("no profile offered".into()).into());
        }

        let zero = self.channel_zero()?;
        let channel = self.allocate_channel()?;
        if let Some(handler) = handler {
            channel.set_request_handler(handler);
        }
        channel.set_state(ChannelState::Starting)?;

        let server_name = if self.inner.server_name_sent.swap(true, Ordering::AcqRel) {
            None
        } else {
            self.inner.config.server_name.clone()
        };
        let offered: Vec<String> = profiles.iter().map(|p| p.uri.clone()).collect();
        let request = ControlMessage::Start(StartRequest {
            number: channel.number(),
            server_name,
            profiles,
        });

        let session = Arc::downgrade(&self.inner);
        let starting = channel.clone();
        let (listener, rx) = ControlReply::new(move |reply| match session.upgrade() {
            Some(inner) => Session { inner }.complete_start(&starting, &offered, reply),
            None => Err(SessionError::TransportClosed.into()),
        });

        tracing::debug!(
            "Session {} requesting channel {}",
            self.inner.id,
            channel.number()
        );
        if let Err(e) = zero.send_msg(request.to_payload(), Some(listener)) {
            self.discard_channel(&channel, "start request not sent");
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok(channel),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.discard_channel(&channel, "session ended during start");
                Err(SessionError::Terminated("session ended before the channel started".into()).into())
            }
        }
    }

    fn complete_start(
        &self,
        channel: &Channel,
        offered: &[String],
        reply: Result<ControlMessage, Error>,
    ) -> Result<(), Error> {
        let profile = match reply {
            Ok(ControlMessage::Profile(profile)) => profile,
            Ok(ControlMessage::Error(error)) => {
                self.discard_channel(channel, "start refused");
                return Err(error.into());
            }
            Ok(other) => {
                self.discard_channel(channel, "bad start reply");
                return Err(ProtocolError::MalformedControl(
                    format!("expected <profile>, got <{}>", other.element_name()).into(),
                )
                .into());
            }
            Err(e) => {
                self.discard_channel(channel, "bad start reply");
                return Err(e);
            }
        };

        if !offered.contains(&profile.uri) {
            self.discard_channel(channel, "peer chose an unrequested profile");
            return Err(SessionError::UnrequestedProfile(profile.uri).into());
        }

        channel.set_profile(&profile.uri, profile.encoding);
        channel.set_start_data(profile.content);
        channel.set_state(ChannelState::Active)?;
        self.apply_window(channel);

        tracing::info!(
            "Session {} started channel {} with {}",
            self.inner.id,
            channel.number(),
            profile.uri
        );
        self.emit(SessionEvent::ChannelStarted {
            number: channel.number(),
            profile: profile.uri,
        });
        Ok(())
    }

    async fn accept_start(&self, message: &Message, start: StartRequest) -> Result<(), BeepError> {
        let number = start.number;
        let state = self.state();
        if state != SessionState::Active {
            return Err(BeepError::new(
                ReplyCode::SERVICE_NOT_AVAILABLE,
                format!("session is {state:?}"),
            ));
        }
        if number == 0 || number > MAX_NUMBER || self.inner.role.allocates(number) {
            return Err(BeepError::new(
                ReplyCode::PARAMETER_INVALID,
                format!("channel number {number} is not available to the peer"),
            ));
        }
        if self.inner.channels.contains_key(&number) {
            return Err(BeepError::new(
                ReplyCode::PARAMETER_INVALID,
                format!("channel {number} is already in use"),
            ));
        }
        if let Some(name) = &start.server_name {
            tracing::debug!("Session {} start request for server {}", self.inner.id, name);
        }

        let negotiated = self.tuning_properties();
        for candidate in start.profiles {
            let Some(listener) = self.inner.registry.lookup(&candidate.uri, &negotiated) else {
                continue;
            };

            let channel = self.new_channel(number);
            channel.set_profile(&candidate.uri, candidate.encoding);
            self.inner.channels.insert(number, channel.clone());

            if let Err(error) =
                listener.start_channel(&channel, candidate.encoding, candidate.content.as_ref())
            {
                tracing::debug!(
                    "Listener for {} refused channel {}: {}",
                    candidate.uri,
                    number,
                    error
                );
                self.discard_channel(&channel, "start refused");
                return Err(error);
            }
            if let Err(e) = channel.set_state(ChannelState::Active) {
                self.discard_channel(&channel, "start failed");
                return Err(BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()));
            }

            let content = match candidate.content {
                Some(data) if channel.has_request_handler() => {
                    match self.piggyback(&channel, data).await {
                        Ok(content) => content,
                        Err(error) => {
                            self.discard_channel(&channel, "piggybacked request refused");
                            return Err(error);
                        }
                    }
                }
                _ => None,
            };

            let reply = ControlMessage::Profile(ProfileElement {
                uri: candidate.uri.clone(),
                encoding: candidate.encoding,
                content,
            });
            if let Err(e) = message.reply(reply.to_payload()) {
                self.discard_channel(&channel, "start reply not sent");
                return Err(BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()));
            }
            self.apply_window(&channel);

            tracing::info!(
                "Session {} peer started channel {} with {}",
                self.inner.id,
                number,
                candidate.uri
            );
            self.emit(SessionEvent::ChannelStarted {
                number,
                profile: candidate.uri,
            });
            return Ok(());
        }

        Err(BeepError::profiles_unsupported())
    }

    /// Run piggybacked start data through the channel's handler
    async fn piggyback(&self, channel: &Channel, data: Bytes) -> Result<Option<Bytes>, BeepError> {
        let (pseudo, rx) = Message::piggybacked(channel.clone(), data);
        channel.dispatch_piggyback(pseudo);
        match rx.await {
            Ok(PiggybackReply::Rpy(stream)) => {
                let (content, complete) = stream.drain();
                if !complete {
                    tracing::warn!(
                        "Piggybacked reply on channel {} still open, sending what is buffered",
                        channel.number()
                    );
                }
                Ok((!content.is_empty()).then_some(content))
            }
            Ok(PiggybackReply::Err(error)) => Err(error),
            Err(_) => Ok(None),
        }
    }

    fn accept_close(&self, message: &Message, close: &CloseRequest) -> Result<(), BeepError> {
        if close.number == 0 {
            return self.accept_session_close(message);
        }

        let Some(channel) = self.channel(close.number) else {
            return Err(BeepError::new(
                ReplyCode::PARAMETER_INVALID,
                format!("channel {} is not open", close.number),
            ));
        };
        self.consent_to_close(&channel)?;
        channel
            .set_state(ChannelState::Closing)
            .map_err(|e| BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()))?;
        if let Err(e) = message.reply(ControlMessage::Ok.to_payload()) {
            tracing::warn!("Failed to confirm close of channel {}: {}", close.number, e);
        }

        self.discard_channel(&channel, "closed by peer");
        tracing::info!(
            "Session {} channel {} closed by peer (code {})",
            self.inner.id,
            close.number,
            close.code
        );
        self.emit(SessionEvent::ChannelClosed {
            number: close.number,
        });
        Ok(())
    }

    fn accept_session_close(&self, message: &Message) -> Result<(), BeepError> {
        self.transition_to(SessionState::ClosePending)
            .map_err(|e| BeepError::new(ReplyCode::SERVICE_NOT_AVAILABLE, e.to_string()))?;

        for channel in self.channels().iter().filter(|c| c.number() != 0) {
            if let Err(error) = self.consent_to_close(channel) {
                self.resume_active();
                return Err(error);
            }
        }

        if let Err(e) = message.reply(ControlMessage::Ok.to_payload()) {
            tracing::warn!("Failed to confirm session close: {}", e);
        }
        self.finish_close("closed by peer");
        Ok(())
    }

    fn consent_to_close(&self, channel: &Channel) -> Result<(), BeepError> {
        match channel
            .profile()
            .and_then(|uri| self.inner.registry.listener(&uri))
        {
            Some(listener) => listener.close_channel(channel),
            None => Ok(()),
        }
    }

    /// Ask the peer to close channel `number`
    ///
    /// Closing a channel that is not open is a no-op. Closing channel zero
    /// closes the session.
    ///
    /// # Errors
    ///
    /// Returns `Error::Beep` if the peer refused; the channel stays active.
    pub async fn close_channel(&self, number: u32, code: ReplyCode) -> Result<(), Error> {
        if number == 0 {
            return self.close().await;
        }
        let Some(channel) = self.channel(number) else {
            return Ok(());
        };
        if channel.state().is_terminal() {
            return Ok(());
        }

        channel.set_state(ChannelState::ClosePending)?;
        let request = ControlMessage::Close(CloseRequest {
            number,
            code,
            lang: None,
            diagnostic: None,
        });
        let session = Arc::downgrade(&self.inner);
        let closing = channel.clone();
        let (listener, rx) = ControlReply::new(move |reply| match session.upgrade() {
            Some(inner) => Session { inner }.complete_channel_close(&closing, reply),
            None => Err(SessionError::TransportClosed.into()),
        });

        let sent = self
            .channel_zero()
            .map_err(Error::from)
            .and_then(|zero| zero.send_msg(request.to_payload(), Some(listener)));
        if let Err(e) = sent {
            if let Err(state) = channel.set_state(ChannelState::Active) {
                tracing::debug!("Channel {} not restored: {}", channel.number(), state);
            }
            return Err(e);
        }

        rx.await
            .map_err(|_| SessionError::Terminated("session ended during close".into()))?
    }

    fn complete_channel_close(
        &self,
        channel: &Channel,
        reply: Result<ControlMessage, Error>,
    ) -> Result<(), Error> {
        match reply {
            Ok(ControlMessage::Ok) => {
                channel.set_state(ChannelState::Closing)?;
                self.discard_channel(channel, "closed");
                tracing::info!("Session {} channel {} closed", self.inner.id, channel.number());
                self.emit(SessionEvent::ChannelClosed {
                    number: channel.number(),
                });
                Ok(())
            }
            Ok(ControlMessage::Error(error)) => {
                channel.set_state(ChannelState::Active)?;
                Err(error.into())
            }
            Ok(other) => {
                channel.set_state(ChannelState::Active)?;
                Err(ProtocolError::MalformedControl(
                    format!("expected <ok>, got <{}>", other.element_name()).into(),
                )
                .into())
            }
            Err(e) => {
                channel.set_state(ChannelState::Active)?;
                Err(e)
            }
        }
    }

    /// Close the session in an orderly way
    ///
    /// Every local start listener must consent, then the peer must agree.
    /// Closing a session that is already closed or aborted is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::Beep` if a listener or the peer refused; the session
    /// stays active.
    pub async fn close(&self) -> Result<(), Error> {
        let state = self.state();
        match state {
            SessionState::Closed | SessionState::Aborted => return Ok(()),
            SessionState::Active => {}
            _ => return Err(SessionError::InvalidState(state).into()),
        }

        for channel in self.channels().iter().filter(|c| c.number() != 0) {
            self.consent_to_close(channel)?;
        }

        let zero = self.channel_zero()?;
        self.transition_to(SessionState::Closing)?;
        let request = ControlMessage::Close(CloseRequest {
            number: 0,
            code: ReplyCode::SUCCESS,
            lang: None,
            diagnostic: None,
        });
        let session = Arc::downgrade(&self.inner);
        let (listener, rx) = ControlReply::new(move |reply| match session.upgrade() {
            Some(inner) => Session { inner }.complete_close(reply),
            None => Err(SessionError::TransportClosed.into()),
        });
        if let Err(e) = zero.send_msg(request.to_payload(), Some(listener)) {
            self.resume_active();
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) if self.state() == SessionState::Closed => Ok(()),
            Err(_) => Err(SessionError::Terminated("session ended during close".into()).into()),
        }
    }

    fn complete_close(&self, reply: Result<ControlMessage, Error>) -> Result<(), Error> {
        match reply {
            Ok(ControlMessage::Ok) => {
                self.finish_close("closed");
                Ok(())
            }
            Ok(ControlMessage::Error(error)) => {
                self.transition_to(SessionState::Active)?;
                Err(error.into())
            }
            Ok(other) => {
                let error = ProtocolError::MalformedControl(
                    format!("expected <ok>, got <{}>", other.element_name()).into(),
                );
                self.terminate(&error.to_string());
                Err(error.into())
            }
            Err(e) => {
                self.terminate(&e.to_string());
                Err(e)
            }
        }
    }

    fn finish_close(&self, reason: &str) {
        if let Err(e) = self.transition_to(SessionState::Closed) {
            tracing::debug!("Session {} not closed: {}", self.inner.id, e);
            return;
        }
        for channel in self.take_channels() {
            channel.shutdown(ChannelState::Closed, reason);
        }
        tracing::info!("Session {} closed", self.inner.id);
        self.emit(SessionEvent::Closed);
        if self.send(Outbound::Shutdown).is_err() {
            tracing::debug!("Session {} transport already gone", self.inner.id);
        }
    }

    /// Abort the session: fail everything in flight and drop the connection
    pub fn terminate(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = SessionState::Aborted;
            self.inner.state_tx.send_replace(SessionState::Aborted);
        }
        tracing::error!("Session {} terminated: {}", self.inner.id, reason);
        *self.inner.termination.lock() = Some(reason.to_string());

        for channel in self.take_channels() {
            channel.shutdown(ChannelState::Aborted, reason);
        }
        self.emit(SessionEvent::Terminated {
            reason: reason.to_string(),
        });
        if self.send(Outbound::Shutdown).is_err() {
            tracing::debug!("Session {} transport already gone", self.inner.id);
        }
    }

    /// Feed one frame read by the transport
    ///
    /// Frames arriving while the session is not reading (before the greeting
    /// was sent, after close) are dropped.
    ///
    /// # Errors
    ///
    /// A returned error has already terminated the session.
    pub fn post_wire_frame(&self, frame: WireFrame) -> Result<(), Error> {
        let state = self.state();
        if !state.accepts_frames() {
            tracing::trace!("Session {} dropping frame while {:?}", self.inner.id, state);
            return Ok(());
        }

        let result = match frame {
            WireFrame::Data(frame) => {
                let number = frame.channel();
                match self.channel(number) {
                    Some(channel) => channel.post_frame(frame).map_err(Error::from),
                    None => Err(ProtocolError::UnknownChannel(number).into()),
                }
            }
            WireFrame::Seq(seq) => {
                match self.channel(seq.channel) {
                    Some(channel) => channel.receive_seq(seq),
                    None => tracing::trace!("SEQ for unknown channel {}", seq.channel),
                }
                Ok(())
            }
        };

        if let Err(e) = &result {
            self.terminate(&e.to_string());
        }
        result
    }

    /// Prepare for a tuning reset
    ///
    /// Called by a tuning profile once it has agreed to a reset, before it
    /// sends its final reply. Reading stops right after the last
    /// channel-zero reply has been written.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidSessionTransition` unless the session is
    /// active.
    pub fn begin_tuning(&self) -> Result<(), Error> {
        self.transition_to(SessionState::TuningPending)?;
        let zero = self.channel_zero()?;
        if let Err(e) = zero.set_state(ChannelState::TuningPending) {
            tracing::debug!("Session {} channel 0 not tuning: {}", self.inner.id, e);
        }
        zero.pause_ingest_when_drained();
        Ok(())
    }

    /// Perform a tuning reset and return the session that replaces this one
    ///
    /// Waits until every channel-zero reply has been written, then has the
    /// transport run `handshake` on the raw stream. The new session has
    /// already exchanged greetings when this returns.
    ///
    /// # Errors
    ///
    /// Any failure terminates this session.
    pub async fn tune(&self, handshake: Box<dyn TuningHandshake>) -> Result<Session, Error> {
        match self.state() {
            SessionState::Active => self.begin_tuning()?,
            SessionState::TuningPending => {}
            state => return Err(SessionError::InvalidState(state).into()),
        }

        let zero = self.channel_zero()?;
        zero.wait_drained().await;
        self.transition_to(SessionState::Tuning)?;
        if let Err(e) = zero.set_state(ChannelState::Tuning) {
            tracing::debug!("Session {} channel 0 not tuning: {}", self.inner.id, e);
        }

        let (done, rx) = oneshot::channel();
        self.send(Outbound::Tune(TuneRequest {
            handshake,
            session: self.clone(),
            done,
        }))?;

        let successor = match rx.await {
            Ok(Ok(successor)) => successor,
            Ok(Err(e)) => {
                self.terminate(&format!("tuning handshake failed: {e}"));
                return Err(e);
            }
            Err(_) => {
                self.terminate("transport went away during tuning");
                return Err(SessionError::TransportClosed.into());
            }
        };

        self.retire(&successor);
        successor.init().await?;
        Ok(successor)
    }

    /// Build the session that continues the connection after a handshake
    ///
    /// Used by transports; credentials and properties from `outcome` are
    /// layered over this session's.
    #[must_use]
    pub fn successor(&self, outcome: TuningOutcome) -> (Session, mpsc::UnboundedReceiver<Outbound>) {
        let mut properties = self.tuning_properties();
        properties.merge(&outcome.properties);
        SessionBuilder::new(self.inner.role)
            .config(self.inner.config.clone())
            .registry(self.inner.registry.clone())
            .local_credential(outcome.local_credential.or_else(|| self.local_credential()))
            .peer_credential(outcome.peer_credential.or_else(|| self.peer_credential()))
            .tuning_properties(properties)
            .build()
    }

    fn retire(&self, successor: &Session) {
        if let Err(e) = self.transition_to(SessionState::Closed) {
            tracing::debug!("Session {} retired from unexpected state: {}", self.inner.id, e);
        }
        for channel in self.take_channels() {
            channel.shutdown(ChannelState::Closed, "session reset");
        }

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        let mut live = Vec::with_capacity(handles.len());
        for weak in handles {
            if let Some(slot) = weak.upgrade() {
                *slot.write() = successor.clone();
                live.push(weak);
            }
        }
        successor.inner.handles.lock().extend(live);

        tracing::info!(
            "Session {} reset, continuing as session {}",
            self.inner.id,
            successor.inner.id
        );
        self.emit(SessionEvent::Reset {
            old: self.inner.id,
            new: successor.inner.id,
        });
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

/// Follows a connection across tuning resets
#[derive(Clone)]
pub struct SessionHandle {
    current: Arc<RwLock<Session>>,
}

impl SessionHandle {
    /// The session currently running the connection
    #[must_use]
    pub fn current(&self) -> Session {
        self.current.read().clone()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SessionHandle")
            .field(&self.current().id())
            .finish()
    }
}

type ReplyAction = Box<dyn FnOnce(Result<ControlMessage, Error>) -> Result<(), Error> + Send>;

/// Applies the reply to one of our channel-zero requests
struct ControlReply {
    pending: Mutex<Option<(ReplyAction, oneshot::Sender<Result<(), Error>>)>>,
}

impl ControlReply {
    fn new(
        action: impl FnOnce(Result<ControlMessage, Error>) -> Result<(), Error> + Send + 'static,
    ) -> (Arc<Self>, oneshot::Receiver<Result<(), Error>>) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Self {
            pending: Mutex::new(Some((Box::new(action), tx))),
        });
        (listener, rx)
    }

    fn complete(&self, reply: Result<ControlMessage, Error>) {
        let pending = self.pending.lock().take();
        if let Some((action, tx)) = pending {
            let _ = tx.send(action(reply));
        }
    }
}

fn parse_reply(message: &Message) -> Result<ControlMessage, Error> {
    let (_, body) = split_entity(message.payload().drain_available());
    let reply = ControlMessage::parse(&body)?;
    let is_error = matches!(reply, ControlMessage::Error(_));
    if is_error != (message.message_type() == MessageType::Err) {
        return Err(ProtocolError::MalformedControl(
            format!(
                "<{}> is not valid in {}",
                reply.element_name(),
                message.message_type().as_str()
            )
            .into(),
        )
        .into());
    }
    Ok(reply)
}

impl ReplyListener for ControlReply {
    fn receive_rpy(&self, message: Message) {
        self.complete(parse_reply(&message));
    }

    fn receive_err(&self, message: Message) {
        self.complete(parse_reply(&message));
    }

    fn receive_ans(&self, _message: Message) {
        self.complete(Err(
            ProtocolError::MalformedControl("ANS on channel zero".into()).into()
        ));
    }

    fn receive_nul(&self, _message: Message) {
        self.complete(Err(
            ProtocolError::MalformedControl("NUL on channel zero".into()).into()
        ));
    }
}

/// Serves the peer's channel-zero requests
struct ControlHandler {
    session: Weak<SessionInner>,
}

#[async_trait]
impl RequestHandler for ControlHandler {
    async fn receive_msg(&self, message: Message) -> Result<(), BeepError> {
        let Some(inner) = self.session.upgrade() else {
            return Ok(());
        };
        let session = Session { inner };

        let (_, body) = message
            .read_entity()
            .await
            .map_err(|e| BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()))?;
        match ControlMessage::parse(&body).map_err(|e| e.to_beep_error())? {
            ControlMessage::Start(start) => session.accept_start(&message, start).await,
            ControlMessage::Close(close) => session.accept_close(&message, &close),
            other => Err(BeepError::new(
                ReplyCode::PARAMETER_ERROR,
                format!("<{}> is not a request", other.element_name()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ProfileEncoding;
    use crate::frame::FrameBuilder;
    use crate::profile::StartChannelListener;
    use std::time::Duration;

    const ECHO: &str = "http://example.org/beep/echo";

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn receive_msg(&self, message: Message) -> Result<(), BeepError> {
            let data = message
                .read_to_end()
                .await
                .map_err(|e| BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()))?;
            message
                .reply(data)
                .map_err(|e| BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()))
        }
    }

    #[derive(Default)]
    struct EchoProfile {
        refuse: Option<BeepError>,
        veto_close: bool,
    }

    impl StartChannelListener for EchoProfile {
        fn start_channel(
            &self,
            channel: &Channel,
            _encoding: ProfileEncoding,
            _data: Option<&Bytes>,
        ) -> Result<(), BeepError> {
            if let Some(error) = &self.refuse {
                return Err(error.clone());
            }
            channel.set_request_handler(Arc::new(Echo));
            Ok(())
        }

        fn close_channel(&self, _channel: &Channel) -> Result<(), BeepError> {
            if self.veto_close {
                return Err(BeepError::new(ReplyCode::REQUESTED_ACTION_REFUSED, "busy"));
            }
            Ok(())
        }
    }

    fn registry(profile: EchoProfile) -> ProfileRegistry {
        let mut registry = ProfileRegistry::new();
        registry.register(ECHO, Arc::new(profile));
        registry
    }

    async fn pump(mut rx: mpsc::UnboundedReceiver<Outbound>, peer: Session) {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(frame) => {
                    let _ = peer.post_wire_frame(frame);
                }
                Outbound::Shutdown => break,
                Outbound::Ingest(_) | Outbound::Tune(_) => {}
            }
        }
    }

    /// Two sessions wired back to back, greetings exchanged
    async fn connected(client: ProfileRegistry, server: ProfileRegistry) -> (Session, Session) {
        let (a, rx_a) = SessionBuilder::new(Role::Initiator).registry(client).build();
        let (b, rx_b) = SessionBuilder::new(Role::Listener).registry(server).build();
        tokio::spawn(pump(rx_a, b.clone()));
        tokio::spawn(pump(rx_b, a.clone()));
        let (ra, rb) = tokio::join!(a.init(), b.init());
        ra.unwrap();
        rb.unwrap();
        (a, b)
    }

    #[test]
    fn test_session_state_transitions() {
        use SessionState::*;

        assert!(Initialized.can_transition(GreetingSent));
        assert!(GreetingSent.can_transition(Active));
        assert!(Active.can_transition(TuningPending));
        assert!(TuningPending.can_transition(Tuning));
        assert!(Tuning.can_transition(Closed));
        assert!(Active.can_transition(Closing));
        assert!(Closing.can_transition(Active));
        assert!(ClosePending.can_transition(Closed));
        assert!(Active.can_transition(Aborted));

        assert!(!Initialized.can_transition(Active));
        assert!(!Tuning.can_transition(Active));
        assert!(!Closed.can_transition(Active));
        assert!(!Aborted.can_transition(Closed));
    }

    #[test]
    fn test_channel_allocation_parity_and_wrap() {
        let (initiator, _rx) = SessionBuilder::new(Role::Initiator).build();
        let numbers: Vec<u32> = (0..3)
            .map(|_| initiator.allocate_channel().unwrap().number())
            .collect();
        assert_eq!(numbers, vec![1, 3, 5]);

        let (listener, _rx) = SessionBuilder::new(Role::Listener).build();
        assert_eq!(listener.allocate_channel().unwrap().number(), 2);
        assert_eq!(listener.allocate_channel().unwrap().number(), 4);

        *initiator.inner.next_channel.lock() = MAX_NUMBER;
        assert_eq!(initiator.allocate_channel().unwrap().number(), MAX_NUMBER);
        // wrapped; lower numbers are taken
        assert_eq!(initiator.allocate_channel().unwrap().number(), 7);
    }

    #[tokio::test]
    async fn test_greeting_exchange() {
        let (a, b) = connected(ProfileRegistry::new(), registry(EchoProfile::default())).await;
        assert_eq!(a.state(), SessionState::Active);
        assert_eq!(b.state(), SessionState::Active);
        assert_eq!(a.peer_profiles(), vec![ECHO.to_string()]);
        assert!(b.peer_profiles().is_empty());
    }

    #[tokio::test]
    async fn test_greeting_timeout() {
        let config = SessionConfig::default()
            .with_greeting_timeout(Duration::from_millis(50));
        let (session, _rx) = SessionBuilder::new(Role::Initiator).config(config).build();
        let err = session.init().await.unwrap_err();
        assert!(matches!(err, Error::Session(SessionError::GreetingFailed(_))));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_greeting_refused() {
        let (session, _rx) = SessionBuilder::new(Role::Initiator).build();
        let init = tokio::spawn({
            let session = session.clone();
            async move { session.init().await }
        });
        while session.state() != SessionState::GreetingSent {
            tokio::task::yield_now().await;
        }

        let body = "Content-Type: application/beep+xml\r\n\r\n<error code='421'>go away</error>";
        let frame = FrameBuilder::new()
            .message_type(MessageType::Err)
            .channel(0)
            .msgno(0)
            .seqno(0)
            .payload(body.as_bytes().to_vec())
            .build()
            .unwrap();
        session.post_wire_frame(frame.into()).unwrap();

        match init.await.unwrap() {
            Err(Error::Beep(error)) => {
                assert_eq!(error.code, ReplyCode::SERVICE_NOT_AVAILABLE);
                assert_eq!(error.diagnostic, "go away");
            }
            other => panic!("expected refusal, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_start_channel_and_echo() {
        let (a, b) = connected(ProfileRegistry::new(), registry(EchoProfile::default())).await;
        let mut events = b.subscribe();

        let channel = a.start_channel(ECHO, None).await.unwrap();
        assert_eq!(channel.number(), 1);
        assert_eq!(channel.state(), ChannelState::Active);
        assert_eq!(channel.profile().as_deref(), Some(ECHO));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ChannelStarted {
                number: 1,
                profile: ECHO.to_string()
            }
        );

        let reply = channel.request("ping").await.unwrap();
        assert_eq!(reply.message_type(), MessageType::Rpy);
        assert_eq!(reply.read_to_end().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_start_unsupported_profile() {
        let (a, b) = connected(ProfileRegistry::new(), registry(EchoProfile::default())).await;
        let err = a.start_channel("urn:missing", None).await.unwrap_err();
        match err {
            Error::Beep(error) => assert_eq!(error.code, ReplyCode::REQUESTED_ACTION_REFUSED),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(a.channel(1).is_none());
        assert!(b.channel(1).is_none());
        assert_eq!(a.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_start_refused_by_listener() {
        let profile = EchoProfile {
            refuse: Some(BeepError::new(ReplyCode::ACTION_NOT_AUTHORIZED, "not you")),
            ..EchoProfile::default()
        };
        let (a, b) = connected(ProfileRegistry::new(), registry(profile)).await;
        let err = a.start_channel(ECHO, None).await.unwrap_err();
        assert_eq!(
            err.as_beep_error().map(|e| e.code),
            Some(ReplyCode::ACTION_NOT_AUTHORIZED)
        );
        assert!(b.channel(1).is_none());

        let err = a.start_channel(ECHO, None).await.unwrap_err();
        assert!(err.as_beep_error().is_some());
        assert!(a.channels().iter().all(|c| c.number() == 0));
    }

    #[tokio::test]
    async fn test_close_channel() {
        let (a, b) = connected(ProfileRegistry::new(), registry(EchoProfile::default())).await;
        let channel = a.start_channel(ECHO, None).await.unwrap();
        let mut events = a.subscribe();

        channel.close().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(a.channel(1).is_none());
        assert!(b.channel(1).is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::ChannelClosed { number: 1 }
        );

        // Already closed
        a.close_channel(1, ReplyCode::SUCCESS).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_channel_vetoed() {
        let profile = EchoProfile {
            veto_close: true,
            ..EchoProfile::default()
        };
        let (a, b) = connected(ProfileRegistry::new(), registry(profile)).await;
        let channel = a.start_channel(ECHO, None).await.unwrap();

        let err = channel.close().await.unwrap_err();
        assert_eq!(
            err.as_beep_error().map(|e| e.code),
            Some(ReplyCode::REQUESTED_ACTION_REFUSED)
        );
        assert_eq!(channel.state(), ChannelState::Active);
        assert!(b.channel(1).is_some());

        let reply = channel.request("still here").await.unwrap();
        assert_eq!(reply.read_to_end().await.unwrap(), Bytes::from_static(b"still here"));
    }

    #[tokio::test]
    async fn test_session_close() {
        let (a, b) = connected(ProfileRegistry::new(), registry(EchoProfile::default())).await;
        let channel = a.start_channel(ECHO, None).await.unwrap();
        let mut events = b.subscribe();

        a.close().await.unwrap();
        assert_eq!(a.state(), SessionState::Closed);
        assert_eq!(b.state(), SessionState::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(a.channels().is_empty());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Closed);

        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_close_vetoed_by_peer() {
        let profile = EchoProfile {
            veto_close: true,
            ..EchoProfile::default()
        };
        let (a, b) = connected(ProfileRegistry::new(), registry(profile)).await;
        a.start_channel(ECHO, None).await.unwrap();

        let err = a.close().await.unwrap_err();
        assert!(err.as_beep_error().is_some());
        assert_eq!(a.state(), SessionState::Active);
        assert_eq!(b.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_terminate_fails_outstanding_requests() {
        let (a, _b) = connected(ProfileRegistry::new(), registry(EchoProfile::default())).await;
        let channel = a.start_channel(ECHO, None).await.unwrap();
        let mut events = a.subscribe();

        a.terminate("test shutdown");
        assert_eq!(a.state(), SessionState::Aborted);
        assert_eq!(channel.state(), ChannelState::Aborted);
        assert!(channel.request("late").await.is_err());
        assert_eq!(a.termination_reason().as_deref(), Some("test shutdown"));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Terminated {
                reason: "test shutdown".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_frame_for_unknown_channel_is_fatal() {
        let (a, _b) = connected(ProfileRegistry::new(), ProfileRegistry::new()).await;
        let frame = FrameBuilder::new()
            .message_type(MessageType::Msg)
            .channel(9)
            .msgno(1)
            .seqno(0)
            .payload(&b"x"[..])
            .build()
            .unwrap();
        let err = a.post_wire_frame(frame.into()).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnknownChannel(9))));
        assert_eq!(a.state(), SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_frames_dropped_before_greeting_sent() {
        let (session, _rx) = SessionBuilder::new(Role::Initiator).build();
        let frame = FrameBuilder::new()
            .message_type(MessageType::Msg)
            .channel(9)
            .msgno(1)
            .seqno(0)
            .payload(&b"x"[..])
            .build()
            .unwrap();
        session.post_wire_frame(frame.into()).unwrap();
        assert_eq!(session.state(), SessionState::Initialized);
    }

    #[tokio::test]
    async fn test_handle_follows_reset() {
        let (old, _rx) = SessionBuilder::new(Role::Initiator).build();
        let handle = old.handle();
        let mut events = old.subscribe();

        *old.inner.state.lock() = SessionState::Tuning;
        let (new, _rx2) = old.successor(TuningOutcome {
            peer_credential: Some(SessionCredential::new("TEST", "peer")),
            ..TuningOutcome::default()
        });
        old.retire(&new);

        assert_eq!(old.state(), SessionState::Closed);
        assert_eq!(handle.current().id(), new.id());
        assert_eq!(
            new.peer_credential().map(|c| c.authenticator),
            Some("peer".to_string())
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Reset {
                old: old.id(),
                new: new.id()
            }
        );
    }
}
