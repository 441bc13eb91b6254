//! Logical messages and reply correlation.
//!
//! A [`Message`] is one MSG/RPY/ERR/ANS/NUL as seen by the application,
//! assembled from one or more frames. Inbound MSGs are handed to the
//! channel's [`RequestHandler`]; replies to locally sent MSGs are handed to
//! the [`ReplyListener`] registered when the MSG was sent, whose progress is
//! tracked by a [`MessageStatus`].

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::channel::Channel;
use crate::control::{self, ControlMessage};
use crate::error::{BeepError, Error, ReplyCode, SessionError};
use crate::frame::MessageType;
use crate::payload::{InputDataStream, MimeHeaders, OutputDataStream};

/// Delivery outcome of an outbound MSG
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Queued, not every frame written yet
    NotSent,
    /// Every frame written, no reply yet
    Sent,
    /// Exchange finished with RPY or ANS/NUL
    ReceivedReply,
    /// Exchange finished with ERR
    ReceivedError,
}

/// Tracks one outbound MSG until its reply arrives
pub struct MessageStatus {
    channel: u32,
    msgno: u32,
    status: Mutex<DeliveryStatus>,
    listener: Option<Arc<dyn ReplyListener>>,
}

impl MessageStatus {
    pub(crate) fn new(
        channel: u32,
        msgno: u32,
        listener: Option<Arc<dyn ReplyListener>>,
    ) -> Self {
        Self {
            channel,
            msgno,
            status: Mutex::new(DeliveryStatus::NotSent),
            listener,
        }
    }

    /// Channel the MSG was sent on
    #[must_use]
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Message number of the MSG
    #[must_use]
    pub fn msgno(&self) -> u32 {
        self.msgno
    }

    /// Current delivery status
    #[must_use]
    pub fn status(&self) -> DeliveryStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: DeliveryStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn notify(&self, message: Message) {
        let Some(listener) = &self.listener else {
            tracing::trace!(
                "No reply listener for msgno {} on channel {}",
                self.msgno,
                self.channel
            );
            return;
        };
        match message.message_type() {
            MessageType::Rpy => listener.receive_rpy(message),
            MessageType::Err => listener.receive_err(message),
            MessageType::Ans => listener.receive_ans(message),
            MessageType::Nul => listener.receive_nul(message),
            MessageType::Msg => {}
        }
    }
}

impl fmt::Debug for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStatus")
            .field("channel", &self.channel)
            .field("msgno", &self.msgno)
            .field("status", &self.status())
            .finish()
    }
}

/// Receives the replies to one outbound MSG
///
/// Each reply object (the RPY, the ERR, every ANS, the final NUL) is handed
/// over exactly once, when its first frame arrives; its payload keeps
/// filling as further frames come in. Callbacks run on the connection's I/O
/// task and must not block.
pub trait ReplyListener: Send + Sync {
    /// Positive reply
    fn receive_rpy(&self, message: Message);

    /// Negative reply
    fn receive_err(&self, message: Message);

    /// One of several answers
    fn receive_ans(&self, message: Message);

    /// End of answers
    fn receive_nul(&self, message: Message);
}

/// [`ReplyListener`] that forwards every reply into a channel
pub struct ReplyCollector {
    tx: mpsc::UnboundedSender<Message>,
}

impl ReplyCollector {
    /// Create a collector and the receiver its replies arrive on
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    fn forward(&self, message: Message) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Reply collector receiver dropped");
        }
    }
}

impl ReplyListener for ReplyCollector {
    fn receive_rpy(&self, message: Message) {
        self.forward(message);
    }

    fn receive_err(&self, message: Message) {
        self.forward(message);
    }

    fn receive_ans(&self, message: Message) {
        self.forward(message);
    }

    fn receive_nul(&self, message: Message) {
        self.forward(message);
    }
}

/// Hands the first RPY or ERR to a oneshot
pub(crate) struct FirstReply {
    tx: Mutex<Option<oneshot::Sender<Message>>>,
}

impl FirstReply {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Message>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn complete(&self, message: Message) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(message);
        }
    }
}

impl ReplyListener for FirstReply {
    fn receive_rpy(&self, message: Message) {
        self.complete(message);
    }

    fn receive_err(&self, message: Message) {
        self.complete(message);
    }

    fn receive_ans(&self, message: Message) {
        self.complete(message);
    }

    fn receive_nul(&self, _message: Message) {}
}

/// Application callback for inbound MSGs on a channel
///
/// MSGs on one channel are delivered one at a time in arrival order; the
/// next is delivered only after the previous one has been replied to.
/// Returning an error replies with ERR carrying that error.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound MSG
    async fn receive_msg(&self, message: Message) -> Result<(), BeepError>;
}

/// Reply to a piggybacked start payload
#[derive(Debug)]
pub(crate) enum PiggybackReply {
    Rpy(OutputDataStream),
    Err(BeepError),
}

pub(crate) enum ReplyRoute {
    /// Replies go on the wire of the owning channel
    Wire,
    /// Replies become the content of a start RPY
    Piggyback(Mutex<Option<oneshot::Sender<PiggybackReply>>>),
    /// Not a MSG
    None,
}

struct MessageInner {
    message_type: MessageType,
    channel: Channel,
    msgno: u32,
    ansno: Option<u32>,
    stream: InputDataStream,
    route: ReplyRoute,
}

/// A logical BEEP message
#[derive(Clone)]
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    pub(crate) fn new(
        message_type: MessageType,
        channel: Channel,
        msgno: u32,
        ansno: Option<u32>,
        stream: InputDataStream,
    ) -> Self {
        let route = if message_type == MessageType::Msg {
            ReplyRoute::Wire
        } else {
            ReplyRoute::None
        };
        Self {
            inner: Arc::new(MessageInner {
                message_type,
                channel,
                msgno,
                ansno,
                stream,
                route,
            }),
        }
    }

    pub(crate) fn piggybacked(
        channel: Channel,
        data: Bytes,
    ) -> (Self, oneshot::Receiver<PiggybackReply>) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            inner: Arc::new(MessageInner {
                message_type: MessageType::Msg,
                channel,
                msgno: 0,
                ansno: None,
                stream: InputDataStream::from_bytes(data),
                route: ReplyRoute::Piggyback(Mutex::new(Some(tx))),
            }),
        };
        (message, rx)
    }

    /// Message type
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        self.inner.message_type
    }

    /// Channel the message belongs to
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Message number
    #[must_use]
    pub fn msgno(&self) -> u32 {
        self.inner.msgno
    }

    /// Answer number (ANS only)
    #[must_use]
    pub fn ansno(&self) -> Option<u32> {
        self.inner.ansno
    }

    /// Payload stream
    #[must_use]
    pub fn payload(&self) -> &InputDataStream {
        &self.inner.stream
    }

    /// True for the synthesized MSG carrying piggybacked start data
    #[must_use]
    pub fn is_piggybacked(&self) -> bool {
        matches!(self.inner.route, ReplyRoute::Piggyback(_))
    }

    /// Wait for the complete payload
    ///
    /// # Errors
    ///
    /// Fails if the session terminates before the message is complete.
    pub async fn read_to_end(&self) -> Result<Bytes, Error> {
        Ok(self.inner.stream.read_to_end().await?)
    }

    /// Wait for the complete payload and split off its MIME header block
    ///
    /// Payloads without a header block yield default headers and the whole
    /// payload as body.
    ///
    /// # Errors
    ///
    /// Fails if the session terminates before the message is complete.
    pub async fn read_entity(&self) -> Result<(MimeHeaders, Bytes), Error> {
        let data = self.read_to_end().await?;
        Ok(split_entity(data))
    }

    /// Wait for the complete payload of an ERR and decode its `<error>`
    ///
    /// # Errors
    ///
    /// Fails if the payload is not an `<error>` element.
    pub async fn read_error(&self) -> Result<BeepError, Error> {
        let (_, body) = self.read_entity().await?;
        match ControlMessage::parse(&body)? {
            ControlMessage::Error(error) => Ok(error),
            other => Err(BeepError::new(
                ReplyCode::GENERAL_SYNTAX_ERROR,
                format!("expected <error>, got {}", other.element_name()),
            )
            .into()),
        }
    }

    /// Reply with RPY
    ///
    /// # Errors
    ///
    /// Fails if this is not a MSG, it was already replied to, or an older
    /// MSG on the channel is still waiting for its reply.
    pub fn reply(&self, data: impl Into<OutputDataStream>) -> Result<(), Error> {
        match &self.inner.route {
            ReplyRoute::Wire => {
                self.inner
                    .channel
                    .send_reply(self.inner.msgno, MessageType::Rpy, data.into())?;
                Ok(())
            }
            ReplyRoute::Piggyback(slot) => {
                Self::piggyback(slot, PiggybackReply::Rpy(data.into()))
            }
            ReplyRoute::None => Err(self.not_replyable()),
        }
    }

    /// Reply with ERR carrying an `<error>` element
    ///
    /// # Errors
    ///
    /// Same conditions as [`reply`](Self::reply).
    pub fn reply_err(&self, error: &BeepError) -> Result<(), Error> {
        match &self.inner.route {
            ReplyRoute::Wire => {
                self.inner.channel.send_reply(
                    self.inner.msgno,
                    MessageType::Err,
                    control::error_payload(error),
                )?;
                Ok(())
            }
            ReplyRoute::Piggyback(slot) => {
                Self::piggyback(slot, PiggybackReply::Err(error.clone()))
            }
            ReplyRoute::None => Err(self.not_replyable()),
        }
    }

    /// Send one ANS; returns its answer number
    ///
    /// # Errors
    ///
    /// Same conditions as [`reply`](Self::reply); piggybacked MSGs accept a
    /// single RPY or ERR only.
    pub fn answer(&self, data: impl Into<OutputDataStream>) -> Result<u32, Error> {
        match &self.inner.route {
            ReplyRoute::Wire => {
                let ansno = self.inner.channel.send_reply(
                    self.inner.msgno,
                    MessageType::Ans,
                    data.into(),
                )?;
                Ok(ansno.unwrap_or_default())
            }
            _ => Err(self.not_replyable()),
        }
    }

    /// Finish a series of ANS with NUL
    ///
    /// # Errors
    ///
    /// Same conditions as [`answer`](Self::answer).
    pub fn reply_nul(&self) -> Result<(), Error> {
        match &self.inner.route {
            ReplyRoute::Wire => {
                self.inner.channel.send_reply(
                    self.inner.msgno,
                    MessageType::Nul,
                    OutputDataStream::from_bytes(Bytes::new()),
                )?;
                Ok(())
            }
            _ => Err(self.not_replyable()),
        }
    }

    pub(crate) fn is_awaiting_reply(&self) -> bool {
        match &self.inner.route {
            ReplyRoute::Wire => self.inner.channel.is_unreplied(self.inner.msgno),
            ReplyRoute::Piggyback(slot) => slot.lock().is_some(),
            ReplyRoute::None => false,
        }
    }

    fn piggyback(
        slot: &Mutex<Option<oneshot::Sender<PiggybackReply>>>,
        reply: PiggybackReply,
    ) -> Result<(), Error> {
        let tx = slot
            .lock()
            .take()
            .ok_or(SessionError::NotReplyable("replied piggyback"))?;
        tx.send(reply)
            .map_err(|_| SessionError::Terminated("start request abandoned".into()))?;
        Ok(())
    }

    fn not_replyable(&self) -> Error {
        let kind = match self.inner.route {
            ReplyRoute::Piggyback(_) => "piggybacked",
            _ => self.inner.message_type.as_str(),
        };
        SessionError::NotReplyable(kind).into()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.inner.message_type)
            .field("channel", &self.inner.channel.number())
            .field("msgno", &self.inner.msgno)
            .field("ansno", &self.inner.ansno)
            .finish()
    }
}

/// Split an optional MIME header block off a complete payload
pub(crate) fn split_entity(data: Bytes) -> (MimeHeaders, Bytes) {
    match MimeHeaders::parse(&data) {
        Some((headers, offset)) => (headers, data.slice(offset..)),
        None => (MimeHeaders::new(), data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use std::sync::Weak;

    fn detached_channel() -> Channel {
        let (tx, _rx) = mpsc::unbounded_channel();
        Channel::new(1, &SessionConfig::default(), tx, Weak::new())
    }

    #[test]
    fn test_split_entity() {
        let (headers, body) =
            split_entity(Bytes::from_static(b"Content-Type: text/plain\r\n\r\nhi"));
        assert_eq!(headers.content_type(), "text/plain");
        assert_eq!(body, Bytes::from_static(b"hi"));

        let (headers, body) = split_entity(Bytes::from_static(b"ping"));
        assert_eq!(headers, MimeHeaders::new());
        assert_eq!(body, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_piggyback_reply_is_single_shot() {
        let (message, rx) = Message::piggybacked(detached_channel(), Bytes::from_static(b"<ready/>"));
        assert!(message.is_piggybacked());
        assert!(message.is_awaiting_reply());
        assert_eq!(
            message.read_to_end().await.unwrap(),
            Bytes::from_static(b"<ready/>")
        );

        message.reply("<proceed/>").unwrap();
        assert!(!message.is_awaiting_reply());
        assert!(matches!(rx.await.unwrap(), PiggybackReply::Rpy(_)));

        assert!(message.reply("again").is_err());
        assert!(message.answer("ans").is_err());
    }

    #[test]
    fn test_replies_are_not_replyable() {
        let message = Message::new(
            MessageType::Rpy,
            detached_channel(),
            1,
            None,
            InputDataStream::from_bytes("pong"),
        );
        assert!(matches!(
            message.reply("x"),
            Err(Error::Session(SessionError::NotReplyable("RPY")))
        ));
    }

    #[test]
    fn test_status_tracks_delivery() {
        let (collector, mut rx) = ReplyCollector::new();
        let status = MessageStatus::new(1, 7, Some(collector));
        assert_eq!(status.status(), DeliveryStatus::NotSent);
        status.set_status(DeliveryStatus::Sent);
        assert_eq!(status.status(), DeliveryStatus::Sent);

        let reply = Message::new(
            MessageType::Rpy,
            detached_channel(),
            7,
            None,
            InputDataStream::from_bytes("pong"),
        );
        status.notify(reply);
        let got = rx.try_recv().unwrap();
        assert_eq!(got.msgno(), 7);
        assert_eq!(got.message_type(), MessageType::Rpy);
    }
}
