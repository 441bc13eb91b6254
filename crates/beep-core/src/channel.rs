//! Channel engine.
//!
//! A channel carries one profile's conversation inside a session. It owns
//! the message numbering for MSGs it originates, both flow-control windows
//! (ours, advertised to the peer with SEQ frames, and the peer's, which caps
//! what we may send), and the queues correlating MSGs with their replies:
//!
//! - `pending`: outbound messages waiting for window, drained strictly FIFO
//! - `awaiting`: sent MSGs whose reply has not finished arriving
//! - `unreplied`: received MSGs we still owe a reply, oldest first
//! - reassembly slots for the inbound MSG, RPY/ERR and ANS in progress
//!
//! Inbound MSGs are handed to the [`RequestHandler`] by a per-channel
//! dispatcher task, one at a time, so the I/O task never runs application
//! code.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Notify};

use crate::config::SessionConfig;
use crate::control::ProfileEncoding;
use crate::error::{BeepError, Error, ProtocolError, ReplyCode, SessionError};
use crate::frame::{Frame, FrameHeader, MessageType, SeqFrame, MAX_NUMBER};
use crate::message::{
    DeliveryStatus, FirstReply, Message, MessageStatus, ReplyListener, RequestHandler,
};
use crate::payload::{ConsumeHook, InputDataStream, OutputDataStream};
use crate::session::{Outbound, Session, SessionInner, SessionState};

/// Initial receive window of every channel (RFC 3081)
pub const DEFAULT_WINDOW_SIZE: u32 = 4096;

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Created, not yet negotiated
    Initialized,
    /// Start request sent, awaiting the peer's answer
    Starting,
    /// Open for traffic
    Active,
    /// Tuning requested, waiting for outstanding replies
    TuningPending,
    /// Tuning handshake running
    Tuning,
    /// Local close requested, waiting for the peer's answer
    ClosePending,
    /// Close accepted, tearing down
    Closing,
    /// Closed normally
    Closed,
    /// Torn down by a session failure
    Aborted,
}

impl ChannelState {
    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(self, to: ChannelState) -> bool {
        match (self, to) {
            // Terminal states
            (ChannelState::Closed | ChannelState::Aborted, _) => false,

            // Any live channel may be closed or aborted
            (_, ChannelState::Closed | ChannelState::Aborted) => true,

            (ChannelState::Initialized, ChannelState::Starting | ChannelState::Active) => true,
            (ChannelState::Starting, ChannelState::Active) => true,
            (
                ChannelState::Active,
                ChannelState::TuningPending | ChannelState::ClosePending | ChannelState::Closing,
            ) => true,
            (ChannelState::TuningPending, ChannelState::Tuning | ChannelState::Active) => true,
            (ChannelState::Tuning, ChannelState::Active) => true,
            // Close vetoed by the peer
            (ChannelState::ClosePending, ChannelState::Closing | ChannelState::Active) => true,

            _ => false,
        }
    }

    /// States in which inbound frames are accepted
    #[must_use]
    pub fn accepts_frames(self) -> bool {
        matches!(
            self,
            ChannelState::Active
                | ChannelState::TuningPending
                | ChannelState::Tuning
                | ChannelState::ClosePending
        )
    }

    /// States in which replies may still be sent
    #[must_use]
    pub fn can_reply(self) -> bool {
        self.accepts_frames() || self == ChannelState::Closing
    }

    /// `Closed` or `Aborted`
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Aborted)
    }
}

/// Snapshot of a channel's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Next sequence number we will send
    pub sent_sequence: u32,
    /// Next sequence number we expect to receive
    pub recv_sequence: u32,
    /// Our receive window
    pub window: u32,
    /// Received bytes not yet consumed
    pub used: u32,
    /// Bytes the peer currently lets us send
    pub peer_window: u32,
    /// Outbound messages not fully written
    pub pending: usize,
    /// Sent MSGs awaiting their reply
    pub awaiting: usize,
}

struct PendingSend {
    message_type: MessageType,
    msgno: u32,
    ansno: Option<u32>,
    stream: OutputDataStream,
    status: Option<Arc<MessageStatus>>,
}

struct SendState {
    sequence: u32,
    next_msgno: u32,
    peer_window: u32,
    frame_size: usize,
    pending: VecDeque<PendingSend>,
    awaiting: VecDeque<Arc<MessageStatus>>,
}

struct Assembly {
    message_type: MessageType,
    msgno: u32,
    stream: InputDataStream,
    /// Delivered to the listener once complete
    deferred: Option<Message>,
}

struct RecvState {
    sequence: u32,
    /// Window size we advertise
    window: u32,
    /// Highest sequence edge (`ackno + window`) the peer has been granted
    granted: u32,
    used: u32,
    freed: u32,
    msg: Option<Assembly>,
    reply: Option<Assembly>,
    answers: HashMap<u32, InputDataStream>,
    /// An ANS arrived for the oldest outstanding MSG
    answered: bool,
}

impl RecvState {
    /// First sequence number not yet consumed by the application
    fn ackno(&self) -> u32 {
        self.sequence.wrapping_sub(self.used)
    }

    /// Bytes the peer may still send
    fn credit(&self) -> u32 {
        self.granted.wrapping_sub(self.sequence)
    }

    /// Advertised window, or the peer's outstanding grant while it is larger
    ///
    /// Always at least `used`, since `sequence` never passes `granted`.
    fn effective_window(&self) -> u32 {
        self.window.max(self.granted.wrapping_sub(self.ackno()))
    }

    /// SEQ for the current state; the granted edge only ever moves forward
    fn window_update(&mut self, channel: u32) -> SeqFrame {
        self.freed = 0;
        let ackno = self.ackno();
        let window = self.window.max(self.used);
        let edge = ackno.wrapping_add(window);
        let ahead = edge.wrapping_sub(self.granted);
        if ahead != 0 && ahead <= MAX_NUMBER {
            self.granted = edge;
        }
        SeqFrame {
            channel,
            ackno,
            window,
        }
    }
}

struct ReplyState {
    unreplied: VecDeque<u32>,
    answering: Option<u32>,
    next_ansno: u32,
}

struct ChannelCore {
    send: SendState,
    recv: RecvState,
    replies: ReplyState,
    /// Stop ingestion once every reply is queued and written
    pause_when_drained: bool,
}

enum Delivery {
    Request(Message),
    Reply(Arc<MessageStatus>, Message),
    Status(Arc<MessageStatus>, DeliveryStatus),
}

struct ChannelInner {
    number: u32,
    state: Mutex<ChannelState>,
    profile: Mutex<Option<String>>,
    encoding: Mutex<ProfileEncoding>,
    start_data: Mutex<Option<Bytes>>,
    handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    core: Mutex<ChannelCore>,
    replied: Notify,
    dispatch: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    session: Weak<SessionInner>,
}

/// One numbered, profile-bound conversation within a session
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        number: u32,
        config: &SessionConfig,
        outbound: mpsc::UnboundedSender<Outbound>,
        session: Weak<SessionInner>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                number,
                state: Mutex::new(ChannelState::Initialized),
                profile: Mutex::new(None),
                encoding: Mutex::new(ProfileEncoding::None),
                start_data: Mutex::new(None),
                handler: Mutex::new(None),
                core: Mutex::new(ChannelCore {
                    send: SendState {
                        sequence: 0,
                        next_msgno: 1,
                        peer_window: DEFAULT_WINDOW_SIZE,
                        frame_size: config.frame_size.max(1),
                        pending: VecDeque::new(),
                        awaiting: VecDeque::new(),
                    },
                    recv: RecvState {
                        sequence: 0,
                        window: DEFAULT_WINDOW_SIZE,
                        granted: DEFAULT_WINDOW_SIZE,
                        used: 0,
                        freed: 0,
                        msg: None,
                        reply: None,
                        answers: HashMap::new(),
                        answered: false,
                    },
                    replies: ReplyState {
                        unreplied: VecDeque::new(),
                        answering: None,
                        next_ansno: 0,
                    },
                    pause_when_drained: false,
                }),
                replied: Notify::new(),
                dispatch: Mutex::new(None),
                outbound,
                session,
            }),
        }
    }

    /// Channel zero: active from the start, with the implicit greeting MSG
    /// (msgno 0) outstanding in both directions
    pub(crate) fn new_zero(
        config: &SessionConfig,
        outbound: mpsc::UnboundedSender<Outbound>,
        session: Weak<SessionInner>,
        greeting_listener: Arc<dyn ReplyListener>,
    ) -> Self {
        let channel = Self::new(0, config, outbound, session);
        *channel.inner.state.lock() = ChannelState::Active;
        {
            let mut core = channel.inner.core.lock();
            core.replies.unreplied.push_back(0);
            core.send
                .awaiting
                .push_back(Arc::new(MessageStatus::new(0, 0, Some(greeting_listener))));
            core.send.next_msgno = 1;
        }
        channel
    }

    /// Channel number
    #[must_use]
    pub fn number(&self) -> u32 {
        self.inner.number
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    /// Profile URI, once negotiated
    #[must_use]
    pub fn profile(&self) -> Option<String> {
        self.inner.profile.lock().clone()
    }

    /// Encoding of the piggybacked start data
    #[must_use]
    pub fn encoding(&self) -> ProfileEncoding {
        *self.inner.encoding.lock()
    }

    /// Content of the peer's `<profile>` element in the start exchange
    #[must_use]
    pub fn start_data(&self) -> Option<Bytes> {
        self.inner.start_data.lock().clone()
    }

    /// Owning session, unless it has gone away
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.inner.session.upgrade().map(Session::from_inner)
    }

    /// Install the handler for inbound MSGs
    pub fn set_request_handler(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.handler.lock() = Some(handler);
    }

    pub(crate) fn has_request_handler(&self) -> bool {
        self.inner.handler.lock().is_some()
    }

    /// Ask the peer to close this channel with reply code 200
    ///
    /// # Errors
    ///
    /// Fails if the session is gone or the peer refuses the close.
    pub async fn close(&self) -> Result<(), Error> {
        match self.session() {
            Some(session) => {
                session
                    .close_channel(self.inner.number, ReplyCode::SUCCESS)
                    .await
            }
            None => Err(SessionError::TransportClosed.into()),
        }
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        let core = self.inner.core.lock();
        ChannelStats {
            sent_sequence: core.send.sequence,
            recv_sequence: core.recv.sequence,
            window: core.recv.effective_window(),
            used: core.recv.used,
            peer_window: core.send.peer_window,
            pending: core.send.pending.len(),
            awaiting: core.send.awaiting.len(),
        }
    }

    pub(crate) fn set_profile(&self, uri: &str, encoding: ProfileEncoding) {
        *self.inner.profile.lock() = Some(uri.to_string());
        *self.inner.encoding.lock() = encoding;
    }

    pub(crate) fn set_start_data(&self, data: Option<Bytes>) {
        *self.inner.start_data.lock() = data;
    }

    /// Move to a new state
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidTransition` if the transition is not
    /// allowed from the current state.
    pub(crate) fn set_state(&self, to: ChannelState) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        if !state.can_transition(to) {
            return Err(SessionError::InvalidTransition {
                channel: self.inner.number,
                from: *state,
                to,
            });
        }
        let from = *state;
        *state = to;
        drop(state);

        tracing::debug!(
            "Channel {} state transition: {:?} -> {:?}",
            self.inner.number,
            from,
            to
        );
        Ok(())
    }

    /// Send a MSG; replies go to `listener`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ChannelState` unless the channel is active.
    pub fn send_msg(
        &self,
        data: impl Into<OutputDataStream>,
        listener: Option<Arc<dyn ReplyListener>>,
    ) -> Result<Arc<MessageStatus>, Error> {
        let state = self.state();
        if state != ChannelState::Active {
            return Err(SessionError::ChannelState {
                channel: self.inner.number,
                state,
            }
            .into());
        }

        let stream = data.into();
        let mut core = self.inner.core.lock();
        let send = &mut core.send;
        let msgno = send.next_msgno;
        send.next_msgno = if msgno == MAX_NUMBER { 0 } else { msgno + 1 };

        let status = Arc::new(MessageStatus::new(self.inner.number, msgno, listener));
        send.awaiting.push_back(status.clone());
        self.enqueue(&mut core, MessageType::Msg, msgno, None, stream, Some(status.clone()));
        Ok(status)
    }

    /// Send a MSG and wait for the first RPY or ERR (or ANS)
    ///
    /// # Errors
    ///
    /// Fails if the MSG cannot be sent or the session terminates first.
    pub async fn request(&self, data: impl Into<OutputDataStream>) -> Result<Message, Error> {
        let (listener, rx) = FirstReply::new();
        self.send_msg(data, Some(listener))?;
        rx.await
            .map_err(|_| SessionError::Terminated("channel closed before reply".into()).into())
    }

    /// Queue a reply to inbound MSG `msgno`; returns the ansno for ANS
    pub(crate) fn send_reply(
        &self,
        msgno: u32,
        message_type: MessageType,
        stream: OutputDataStream,
    ) -> Result<Option<u32>, SessionError> {
        let number = self.inner.number;
        let state = self.state();
        if !state.can_reply() {
            return Err(SessionError::ChannelState {
                channel: number,
                state,
            });
        }

        let mut guard = self.inner.core.lock();
        let core = &mut *guard;
        let replies = &mut core.replies;
        match replies.unreplied.front() {
            Some(&front) if front == msgno => {}
            Some(&front) if replies.unreplied.contains(&msgno) => {
                return Err(SessionError::ReplyOutOfOrder {
                    channel: number,
                    expected: front,
                    actual: msgno,
                });
            }
            _ => {
                return Err(SessionError::NotAwaitingReply {
                    channel: number,
                    msgno,
                });
            }
        }

        let mut ansno = None;
        let mut finished = false;
        match message_type {
            MessageType::Rpy | MessageType::Err => {
                if replies.answering == Some(msgno) {
                    return Err(SessionError::AnswerInProgress(msgno));
                }
                replies.unreplied.pop_front();
                finished = true;
            }
            MessageType::Ans => {
                replies.answering = Some(msgno);
                ansno = Some(replies.next_ansno);
                replies.next_ansno = if replies.next_ansno == MAX_NUMBER {
                    0
                } else {
                    replies.next_ansno + 1
                };
            }
            MessageType::Nul => {
                replies.unreplied.pop_front();
                replies.answering = None;
                replies.next_ansno = 0;
                finished = true;
            }
            MessageType::Msg => return Err(SessionError::NotReplyable("MSG")),
        }

        self.enqueue(core, message_type, msgno, ansno, stream, None);
        drop(guard);

        if finished {
            self.inner.replied.notify_waiters();
        }
        Ok(ansno)
    }

    pub(crate) fn is_unreplied(&self, msgno: u32) -> bool {
        self.inner.core.lock().replies.unreplied.contains(&msgno)
    }

    /// Wait until `msgno` (or every inbound MSG, for `None`) has been
    /// replied to, or the channel is torn down
    pub(crate) async fn wait_replied(&self, msgno: Option<u32>) {
        loop {
            let notified = self.inner.replied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state().is_terminal() {
                return;
            }
            let done = {
                let core = self.inner.core.lock();
                match msgno {
                    Some(msgno) => !core.replies.unreplied.contains(&msgno),
                    None => core.replies.unreplied.is_empty(),
                }
            };
            if done {
                return;
            }
            notified.await;
        }
    }

    /// Change our receive window and advertise it to the peer
    ///
    /// # Errors
    ///
    /// Returns `SessionError::ChannelState` if the channel is closed.
    pub fn set_receive_window(&self, size: u32) -> Result<(), SessionError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(SessionError::ChannelState {
                channel: self.inner.number,
                state,
            });
        }

        let mut core = self.inner.core.lock();
        let recv = &mut core.recv;
        recv.window = size.clamp(1, MAX_NUMBER);
        let seq = recv.window_update(self.inner.number);
        tracing::debug!(
            "Channel {} receive window set to {} (effective {})",
            self.inner.number,
            recv.window,
            recv.effective_window()
        );
        self.emit(Outbound::Frame(seq.into()));
        Ok(())
    }

    /// Validate and absorb one inbound data frame
    ///
    /// # Errors
    ///
    /// Any error is fatal to the session.
    pub(crate) fn post_frame(&self, frame: Frame) -> Result<(), ProtocolError> {
        let number = self.inner.number;
        let state = self.state();
        if !state.accepts_frames() {
            return Err(ProtocolError::ChannelNotAccepting {
                channel: number,
                state,
            });
        }

        let header = frame.header();
        let payload = frame.into_payload();
        let mut deliveries = Vec::new();
        let mut retired = Vec::new();
        {
            let mut core = self.inner.core.lock();
            let core = &mut *core;

            if header.seqno != core.recv.sequence {
                return Err(ProtocolError::IncorrectSeqno {
                    channel: number,
                    expected: core.recv.sequence,
                    actual: header.seqno,
                });
            }
            if header.size > core.recv.credit() {
                return Err(ProtocolError::WindowOverflow {
                    channel: number,
                    used: u64::from(core.recv.used) + u64::from(header.size),
                    window: core.recv.effective_window(),
                });
            }

            let stream = match header.message_type {
                MessageType::Msg => self.accept_msg(core, &header, &mut deliveries, &mut retired)?,
                MessageType::Rpy | MessageType::Err => {
                    self.accept_reply(core, &header, &mut deliveries, &mut retired)?
                }
                MessageType::Ans => {
                    self.accept_answer(core, &header, &mut deliveries, &mut retired)?
                }
                MessageType::Nul => {
                    self.accept_nul(core, &header, &mut deliveries)?;
                    None
                }
            };

            core.recv.used += header.size;
            core.recv.sequence = core.recv.sequence.wrapping_add(header.size);

            if let Some(stream) = stream {
                for chunk in payload {
                    stream.push(chunk);
                }
                if !header.more {
                    stream.set_complete();
                }
            }
        }

        if number == 0 && matches!(header.message_type, MessageType::Rpy | MessageType::Err) {
            self.free_receive_bytes(header.size as usize);
        }

        tracing::trace!(
            "Channel {} accepted {} msgno {} ({} bytes{})",
            number,
            header.message_type,
            header.msgno,
            header.size,
            if header.more { ", more" } else { "" }
        );

        for delivery in deliveries {
            match delivery {
                Delivery::Request(message) => self.dispatch(message),
                Delivery::Reply(status, message) => status.notify(message),
                Delivery::Status(status, delivered) => status.set_status(delivered),
            }
        }
        drop(retired);
        Ok(())
    }

    fn accept_msg(
        &self,
        core: &mut ChannelCore,
        header: &FrameHeader,
        deliveries: &mut Vec<Delivery>,
        retired: &mut Vec<InputDataStream>,
    ) -> Result<Option<InputDataStream>, ProtocolError> {
        let number = self.inner.number;
        let stream = match &core.recv.msg {
            Some(assembly) => {
                if assembly.msgno != header.msgno {
                    return Err(ProtocolError::IncorrectMsgno {
                        channel: number,
                        expected: assembly.msgno,
                        actual: header.msgno,
                    });
                }
                assembly.stream.clone()
            }
            None => {
                if core.replies.unreplied.contains(&header.msgno) {
                    return Err(ProtocolError::DuplicateMsgno {
                        channel: number,
                        msgno: header.msgno,
                    });
                }
                let stream = InputDataStream::new(Some(self.consume_hook()));
                let message = Message::new(
                    MessageType::Msg,
                    self.clone(),
                    header.msgno,
                    None,
                    stream.clone(),
                );
                core.replies.unreplied.push_back(header.msgno);
                core.recv.msg = Some(Assembly {
                    message_type: MessageType::Msg,
                    msgno: header.msgno,
                    stream: stream.clone(),
                    deferred: None,
                });
                deliveries.push(Delivery::Request(message));
                stream
            }
        };

        if !header.more {
            if let Some(assembly) = core.recv.msg.take() {
                retired.push(assembly.stream);
            }
        }
        Ok(Some(stream))
    }

    fn awaiting_head(
        &self,
        core: &ChannelCore,
        header: &FrameHeader,
    ) -> Result<Arc<MessageStatus>, ProtocolError> {
        let number = self.inner.number;
        let head = core
            .send
            .awaiting
            .front()
            .ok_or(ProtocolError::UnsolicitedReply {
                channel: number,
                msgno: header.msgno,
            })?;
        if head.msgno() != header.msgno {
            return Err(ProtocolError::ReplyOutOfOrder {
                channel: number,
                expected: head.msgno(),
                actual: header.msgno,
            });
        }
        Ok(head.clone())
    }

    fn accept_reply(
        &self,
        core: &mut ChannelCore,
        header: &FrameHeader,
        deliveries: &mut Vec<Delivery>,
        retired: &mut Vec<InputDataStream>,
    ) -> Result<Option<InputDataStream>, ProtocolError> {
        let number = self.inner.number;
        let head = self.awaiting_head(core, header)?;
        if core.recv.answered {
            return Err(ProtocolError::IncorrectType {
                channel: number,
                expected: MessageType::Ans.as_str(),
                actual: header.message_type.as_str(),
            });
        }

        let stream = match &core.recv.reply {
            Some(assembly) => {
                if assembly.message_type != header.message_type {
                    return Err(ProtocolError::IncorrectType {
                        channel: number,
                        expected: assembly.message_type.as_str(),
                        actual: header.message_type.as_str(),
                    });
                }
                assembly.stream.clone()
            }
            None => {
                // Channel-zero replies are interpreted whole, on the I/O task.
                // Their window is returned as frames arrive instead.
                let hook = (number != 0).then(|| self.consume_hook());
                let stream = InputDataStream::new(hook);
                let message = Message::new(
                    header.message_type,
                    self.clone(),
                    header.msgno,
                    None,
                    stream.clone(),
                );
                let deferred = if number == 0 {
                    Some(message)
                } else {
                    deliveries.push(Delivery::Reply(head.clone(), message));
                    None
                };
                core.recv.reply = Some(Assembly {
                    message_type: header.message_type,
                    msgno: header.msgno,
                    stream: stream.clone(),
                    deferred,
                });
                stream
            }
        };

        if !header.more {
            core.send.awaiting.pop_front();
            let delivered = if header.message_type == MessageType::Err {
                DeliveryStatus::ReceivedError
            } else {
                DeliveryStatus::ReceivedReply
            };
            deliveries.push(Delivery::Status(head.clone(), delivered));
            if let Some(assembly) = core.recv.reply.take() {
                if let Some(message) = assembly.deferred {
                    deliveries.push(Delivery::Reply(head, message));
                }
                retired.push(assembly.stream);
            }
        }
        Ok(Some(stream))
    }

    fn accept_answer(
        &self,
        core: &mut ChannelCore,
        header: &FrameHeader,
        deliveries: &mut Vec<Delivery>,
        retired: &mut Vec<InputDataStream>,
    ) -> Result<Option<InputDataStream>, ProtocolError> {
        let number = self.inner.number;
        let head = self.awaiting_head(core, header)?;
        if let Some(assembly) = &core.recv.reply {
            return Err(ProtocolError::IncorrectType {
                channel: number,
                expected: assembly.message_type.as_str(),
                actual: MessageType::Ans.as_str(),
            });
        }
        let ansno = header.ansno.ok_or(ProtocolError::MissingAnsno(number))?;
        core.recv.answered = true;

        let stream = match core.recv.answers.get(&ansno) {
            Some(stream) => stream.clone(),
            None => {
                let stream = InputDataStream::new(Some(self.consume_hook()));
                let message = Message::new(
                    MessageType::Ans,
                    self.clone(),
                    header.msgno,
                    Some(ansno),
                    stream.clone(),
                );
                deliveries.push(Delivery::Reply(head, message));
                core.recv.answers.insert(ansno, stream.clone());
                stream
            }
        };

        if !header.more {
            if let Some(done) = core.recv.answers.remove(&ansno) {
                retired.push(done);
            }
        }
        Ok(Some(stream))
    }

    fn accept_nul(
        &self,
        core: &mut ChannelCore,
        header: &FrameHeader,
        deliveries: &mut Vec<Delivery>,
    ) -> Result<(), ProtocolError> {
        let number = self.inner.number;
        let head = self.awaiting_head(core, header)?;
        if header.size != 0 || header.more {
            return Err(ProtocolError::MalformedNul(number));
        }
        if !core.recv.answers.is_empty() || core.recv.reply.is_some() {
            return Err(ProtocolError::IncorrectType {
                channel: number,
                expected: MessageType::Ans.as_str(),
                actual: MessageType::Nul.as_str(),
            });
        }

        core.send.awaiting.pop_front();
        core.recv.answered = false;
        let message = Message::new(
            MessageType::Nul,
            self.clone(),
            header.msgno,
            None,
            InputDataStream::from_bytes(Bytes::new()),
        );
        deliveries.push(Delivery::Reply(head.clone(), message));
        deliveries.push(Delivery::Status(head, DeliveryStatus::ReceivedReply));
        Ok(())
    }

    /// Apply a peer window update and resume queued sends
    pub(crate) fn receive_seq(&self, seq: SeqFrame) {
        let mut core = self.inner.core.lock();
        let send = &mut core.send;
        let credit = seq.ackno.wrapping_add(seq.window).wrapping_sub(send.sequence);
        if credit > seq.window {
            tracing::warn!(
                "Ignoring stale SEQ on channel {}: ackno {} window {} (sent {})",
                self.inner.number,
                seq.ackno,
                seq.window,
                send.sequence
            );
            return;
        }
        send.peer_window = credit;
        tracing::trace!(
            "Channel {} peer window now {}",
            self.inner.number,
            credit
        );
        self.flush(&mut core);
    }

    fn consume_hook(&self) -> ConsumeHook {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |consumed| {
            if let Some(inner) = weak.upgrade() {
                Channel { inner }.free_receive_bytes(consumed);
            }
        })
    }

    /// Reclaim window after the application consumed `consumed` bytes
    fn free_receive_bytes(&self, consumed: usize) {
        if self.state().is_terminal() {
            return;
        }
        // The peer may already be reading handshake bytes instead of frames
        let tuning = self.session().is_some_and(|session| {
            matches!(
                session.state(),
                SessionState::TuningPending | SessionState::Tuning
            )
        });
        let consumed = u32::try_from(consumed).unwrap_or(u32::MAX);
        let mut core = self.inner.core.lock();
        let recv = &mut core.recv;
        recv.used = recv.used.saturating_sub(consumed);
        recv.freed = recv.freed.saturating_add(consumed);
        if tuning || recv.freed < (recv.window / 2).max(1) {
            return;
        }
        let seq = recv.window_update(self.inner.number);
        self.emit(Outbound::Frame(seq.into()));
    }

    fn enqueue(
        &self,
        core: &mut ChannelCore,
        message_type: MessageType,
        msgno: u32,
        ansno: Option<u32>,
        stream: OutputDataStream,
        status: Option<Arc<MessageStatus>>,
    ) {
        let weak = Arc::downgrade(&self.inner);
        stream.set_waker(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                Channel { inner }.flush_queued();
            }
        }));
        core.send.pending.push_back(PendingSend {
            message_type,
            msgno,
            ansno,
            stream,
            status,
        });
        self.flush(core);
    }

    fn flush_queued(&self) {
        let mut core = self.inner.core.lock();
        self.flush(&mut core);
    }

    /// Emit frames for pending messages while the peer's window allows
    fn flush(&self, core: &mut ChannelCore) {
        let send = &mut core.send;
        while let Some(head) = send.pending.front() {
            let max = send.frame_size.min(send.peer_window as usize);
            let (chunks, size, finished) = head.stream.take(max);
            if size == 0 && !finished {
                break;
            }

            let mut frame = Frame::new(head.message_type, self.inner.number, head.msgno, send.sequence);
            frame.set_ansno(head.ansno);
            for chunk in chunks {
                frame.add_payload(chunk);
            }
            frame.set_last(finished);

            #[allow(clippy::cast_possible_truncation)]
            let size = size as u32;
            send.sequence = send.sequence.wrapping_add(size);
            send.peer_window -= size;
            self.emit(Outbound::Frame(frame.into()));

            if finished {
                if let Some(done) = send.pending.pop_front() {
                    done.stream.clear_waker();
                    if let Some(status) = done.status {
                        status.set_status(DeliveryStatus::Sent);
                    }
                }
            }
        }
        self.pause_if_drained(core);
    }

    /// Arm [`Self::pause_if_drained`]; used ahead of a tuning reset
    ///
    /// Reading continues until the last reply is on its way, so window
    /// updates that release it are still seen.
    pub(crate) fn pause_ingest_when_drained(&self) {
        let mut core = self.inner.core.lock();
        core.pause_when_drained = true;
        self.pause_if_drained(&mut core);
    }

    /// Queue `Ingest(false)` right behind the final reply frame
    fn pause_if_drained(&self, core: &mut ChannelCore) {
        if core.pause_when_drained
            && core.send.pending.is_empty()
            && core.replies.unreplied.is_empty()
        {
            core.pause_when_drained = false;
            tracing::debug!("Channel {} drained, pausing ingestion", self.inner.number);
            self.emit(Outbound::Ingest(false));
            self.inner.replied.notify_waiters();
        }
    }

    /// Wait until an armed drain has paused ingestion, or the channel is
    /// torn down
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.inner.replied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state().is_terminal() || !self.inner.core.lock().pause_when_drained {
                return;
            }
            notified.await;
        }
    }

    fn emit(&self, outbound: Outbound) {
        if self.inner.outbound.send(outbound).is_err() {
            tracing::debug!(
                "Channel {}: transport gone, dropping outbound frame",
                self.inner.number
            );
        }
    }

    fn dispatch(&self, message: Message) {
        let mut slot = self.inner.dispatch.lock();
        if slot.is_none() {
            if self.state().is_terminal() {
                return;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_dispatcher(Arc::downgrade(&self.inner), rx));
            *slot = Some(tx);
        }
        if let Some(tx) = slot.as_ref() {
            let _ = tx.send(message);
        }
    }

    /// Deliver a synthesized MSG as if it had arrived on the wire
    pub(crate) fn dispatch_piggyback(&self, message: Message) {
        self.dispatch(message);
    }

    /// Tear the channel down, failing everything in flight
    pub(crate) fn shutdown(&self, final_state: ChannelState, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            if state.is_terminal() {
                return;
            }
            tracing::debug!(
                "Channel {} state transition: {:?} -> {:?} ({})",
                self.inner.number,
                *state,
                final_state,
                reason
            );
            *state = final_state;
        }

        let (msg, reply, answers, awaiting, pending) = {
            let mut core = self.inner.core.lock();
            (
                core.recv.msg.take(),
                core.recv.reply.take(),
                std::mem::take(&mut core.recv.answers),
                std::mem::take(&mut core.send.awaiting),
                std::mem::take(&mut core.send.pending),
            )
        };
        for stream in msg
            .into_iter()
            .chain(reply)
            .map(|assembly| assembly.stream)
            .chain(answers.into_values())
        {
            stream.abort(reason);
        }
        for send in pending {
            send.stream.clear_waker();
        }
        drop(awaiting);

        self.inner.dispatch.lock().take();
        self.inner.replied.notify_waiters();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.inner.number)
            .field("state", &self.state())
            .field("profile", &self.profile())
            .finish()
    }
}

async fn run_dispatcher(channel: Weak<ChannelInner>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let Some(inner) = channel.upgrade() else {
            break;
        };
        let channel = Channel { inner };
        let handler = channel.inner.handler.lock().clone();
        let msgno = message.msgno();

        let result = match handler {
            Some(handler) => handler.receive_msg(message.clone()).await,
            None => Err(BeepError::new(
                ReplyCode::REQUESTED_ACTION_ABORTED,
                "no request handler on channel",
            )),
        };
        if let Err(error) = result {
            tracing::debug!(
                "Handler on channel {} failed msgno {}: {}",
                channel.number(),
                msgno,
                error
            );
            if message.is_awaiting_reply() {
                if let Err(e) = message.reply_err(&error) {
                    tracing::warn!("Failed to send ERR on channel {}: {}", channel.number(), e);
                }
            }
        }

        if !message.is_piggybacked() {
            channel.wait_replied(Some(msgno)).await;
        }
    }
}
