//! Error types for the BEEP core.
//!
//! Errors fall into four families:
//!
//! - **Frame / protocol errors** ([`FrameError`], [`ProtocolError`]) corrupt the
//!   shared byte stream and always terminate the session.
//! - **Application errors** ([`BeepError`]) travel to the peer as an `<error>`
//!   element inside an ERR reply and leave the session intact.
//! - **Local usage errors** ([`SessionError`]) are returned synchronously to
//!   the caller (wrong state, unknown channel, ...).
//! - **Transport errors** surface as [`Error::Io`] and terminate the session.

use std::borrow::Cow;
use std::fmt;

use thiserror::Error;

use crate::channel::ChannelState;
use crate::session::SessionState;

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    /// Wire frame could not be decoded
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Fatal protocol violation
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Local usage or lifecycle error
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Error reported by the peer (or to be reported to it)
    #[error("{0}")]
    Beep(#[from] BeepError),

    /// Malformed channel-zero control message
    #[error("control message error: {0}")]
    Control(#[from] ControlError),

    /// Byte-stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Frame-level decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Header line did not contain the expected number of tokens
    #[error("malformed header: expected {expected} tokens, got {actual}")]
    TokenCount {
        /// Expected token count
        expected: &'static str,
        /// Actual token count
        actual: usize,
    },

    /// Unknown message type keyword
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A numeric field was not a decimal integer
    #[error("non-numeric {field}: {value:?}")]
    NotNumeric {
        /// Header field name
        field: &'static str,
        /// Offending token
        value: String,
    },

    /// A numeric field was outside its legal range
    #[error("{field} out of range: {value}")]
    OutOfRange {
        /// Header field name
        field: &'static str,
        /// Parsed value
        value: u64,
    },

    /// Continuation indicator was neither `.` nor `*`
    #[error("invalid continuation indicator: {0:?}")]
    InvalidMore(String),

    /// Header line exceeded the maximum length without a CRLF
    #[error("header line too long")]
    HeaderTooLong,

    /// Header line was not valid ASCII
    #[error("header is not ASCII")]
    NotAscii,

    /// Payload was not followed by `END\r\n`
    #[error("missing frame trailer")]
    MissingTrailer,

    /// Payload exceeded the codec's maximum frame size
    #[error("frame payload of {size} bytes exceeds limit of {max}")]
    TooLarge {
        /// Declared payload size
        size: usize,
        /// Configured limit
        max: usize,
    },
}

/// Violations that are fatal to the whole session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame arrived on a channel that is not accepting frames
    #[error("channel {channel} is {state:?} and cannot accept frames")]
    ChannelNotAccepting {
        /// Channel number
        channel: u32,
        /// Channel state at receipt
        state: ChannelState,
    },

    /// Frame referenced a channel that is not open
    #[error("frame received for unknown channel {0}")]
    UnknownChannel(u32),

    /// MSG number collides with an unreplied MSG
    #[error("duplicate msgno {msgno} on channel {channel}")]
    DuplicateMsgno {
        /// Channel number
        channel: u32,
        /// Offending message number
        msgno: u32,
    },

    /// Continuation frame does not belong to the in-progress message
    #[error("incorrect message number on channel {channel}: expected {expected}, got {actual}")]
    IncorrectMsgno {
        /// Channel number
        channel: u32,
        /// Message number in progress
        expected: u32,
        /// Message number received
        actual: u32,
    },

    /// Continuation frame changed message type mid-message
    #[error("incorrect message type on channel {channel}: expected {expected}, got {actual}")]
    IncorrectType {
        /// Channel number
        channel: u32,
        /// Type in progress
        expected: &'static str,
        /// Type received
        actual: &'static str,
    },

    /// Sequence number did not match the expected stream offset
    #[error("incorrect sequence number on channel {channel}: expected {expected}, got {actual}")]
    IncorrectSeqno {
        /// Channel number
        channel: u32,
        /// Expected sequence number
        expected: u32,
        /// Received sequence number
        actual: u32,
    },

    /// Reply arrived while no MSG was outstanding
    #[error("received unsolicited reply on channel {channel} (msgno {msgno})")]
    UnsolicitedReply {
        /// Channel number
        channel: u32,
        /// Reply message number
        msgno: u32,
    },

    /// Reply arrived for a MSG other than the oldest outstanding one
    #[error("received reply out of order on channel {channel}: expected {expected}, got {actual}")]
    ReplyOutOfOrder {
        /// Channel number
        channel: u32,
        /// Oldest outstanding msgno
        expected: u32,
        /// Reply msgno
        actual: u32,
    },

    /// Peer sent more bytes than the advertised receive window
    #[error("receive window overflow on channel {channel}: {used} of {window} bytes")]
    WindowOverflow {
        /// Channel number
        channel: u32,
        /// Bytes that would be in use
        used: u64,
        /// Window size
        window: u32,
    },

    /// NUL reply carried payload or a continuation flag
    #[error("malformed NUL frame on channel {0}")]
    MalformedNul(u32),

    /// Answer frame arrived without an answer number
    #[error("ANS frame without answer number on channel {0}")]
    MissingAnsno(u32),

    /// Channel-zero traffic could not be interpreted
    #[error("malformed channel zero message: {0}")]
    MalformedControl(Cow<'static, str>),

    /// Frame could not be decoded
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Local usage and lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Session state machine rejected the transition
    #[error("invalid session transition: {from:?} -> {to:?}")]
    InvalidSessionTransition {
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },

    /// Channel state machine rejected the transition
    #[error("invalid channel transition on channel {channel}: {from:?} -> {to:?}")]
    InvalidTransition {
        /// Channel number
        channel: u32,
        /// Current state
        from: ChannelState,
        /// Requested state
        to: ChannelState,
    },

    /// Operation requires a different session state
    #[error("session is {0:?}")]
    InvalidState(SessionState),

    /// Operation requires a different channel state
    #[error("channel {channel} is {state:?}")]
    ChannelState {
        /// Channel number
        channel: u32,
        /// Current state
        state: ChannelState,
    },

    /// Channel number is not open on this session
    #[error("unknown channel: {0}")]
    UnknownChannel(u32),

    /// Reply requested for a MSG that is not awaiting one
    #[error("msgno {msgno} on channel {channel} is not awaiting a reply")]
    NotAwaitingReply {
        /// Channel number
        channel: u32,
        /// Message number
        msgno: u32,
    },

    /// Reply requested for a MSG other than the oldest unreplied one
    #[error("replies on channel {channel} must follow msgno order: next is {expected}, got {actual}")]
    ReplyOutOfOrder {
        /// Channel number
        channel: u32,
        /// Oldest unreplied msgno
        expected: u32,
        /// Requested msgno
        actual: u32,
    },

    /// RPY/ERR mixed with ANS/NUL for one MSG
    #[error("msgno {0} is being answered with ANS; finish with NUL")]
    AnswerInProgress(u32),

    /// Only MSG messages can be replied to
    #[error("cannot reply to a {0} message")]
    NotReplyable(&'static str),

    /// Greeting exchange did not complete in time
    #[error("greeting exchange failed: {0}")]
    GreetingFailed(Cow<'static, str>),

    /// Session was terminated; pending operations are abandoned
    #[error("session terminated: {0}")]
    Terminated(Cow<'static, str>),

    /// Transport driver is gone
    #[error("transport closed")]
    TransportClosed,

    /// Profile URI not registered or not permitted
    #[error("profile not available: {0}")]
    ProfileUnavailable(String),

    /// Peer selected a profile that was never offered
    #[error("peer selected unrequested profile {0}")]
    UnrequestedProfile(String),
}

/// Numeric reply code from RFC 3080 section 8
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplyCode(pub u16);

impl ReplyCode {
    /// success
    pub const SUCCESS: Self = Self(200);
    /// service not available
    pub const SERVICE_NOT_AVAILABLE: Self = Self(421);
    /// requested action not taken (e.g., lock already in use)
    pub const REQUESTED_ACTION_NOT_TAKEN: Self = Self(450);
    /// requested action aborted (e.g., local error in processing)
    pub const REQUESTED_ACTION_ABORTED: Self = Self(451);
    /// temporary authentication failure
    pub const TEMPORARY_AUTHENTICATION_FAILURE: Self = Self(454);
    /// general syntax error (e.g., poorly-formed XML)
    pub const GENERAL_SYNTAX_ERROR: Self = Self(500);
    /// syntax error in parameters (e.g., non-valid XML)
    pub const PARAMETER_ERROR: Self = Self(501);
    /// parameter not implemented
    pub const PARAMETER_NOT_IMPLEMENTED: Self = Self(504);
    /// authentication required
    pub const AUTHENTICATION_REQUIRED: Self = Self(530);
    /// authentication mechanism insufficient
    pub const AUTHENTICATION_MECHANISM_INSUFFICIENT: Self = Self(534);
    /// authentication failure
    pub const AUTHENTICATION_FAILURE: Self = Self(535);
    /// action not authorized for user
    pub const ACTION_NOT_AUTHORIZED: Self = Self(537);
    /// authentication mechanism requires encryption
    pub const AUTHENTICATION_REQUIRES_ENCRYPTION: Self = Self(538);
    /// requested action not taken (e.g., no requested profiles are acceptable)
    pub const REQUESTED_ACTION_REFUSED: Self = Self(550);
    /// parameter invalid
    pub const PARAMETER_INVALID: Self = Self(553);
    /// transaction failed (e.g., policy violation)
    pub const TRANSACTION_FAILED: Self = Self(554);

    /// Raw numeric value
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self.0
    }

    /// 4yz codes describe transient conditions
    #[must_use]
    pub fn is_transient(self) -> bool {
        (400..500).contains(&self.0)
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Application-level BEEP error, carried in an `<error>` element
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("BEEP error {code}: {diagnostic}")]
pub struct BeepError {
    /// Reply code
    pub code: ReplyCode,
    /// Human-readable diagnostic
    pub diagnostic: String,
    /// Language of the diagnostic (`xml:lang`)
    pub lang: Option<String>,
}

impl BeepError {
    /// Create an error with a code and diagnostic
    pub fn new(code: ReplyCode, diagnostic: impl Into<String>) -> Self {
        Self {
            code,
            diagnostic: diagnostic.into(),
            lang: None,
        }
    }

    /// Attach an `xml:lang` tag
    #[must_use]
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    /// 550, none of the requested profiles is supported
    pub fn profiles_unsupported() -> Self {
        Self::new(
            ReplyCode::REQUESTED_ACTION_REFUSED,
            "all requested profiles are unsupported",
        )
    }
}

/// Channel-zero XML syntax errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Payload ended inside an element
    #[error("unexpected end of document")]
    UnexpectedEof,

    /// Markup could not be parsed at the given byte offset
    #[error("malformed markup at offset {0}")]
    Malformed(usize),

    /// Closing tag did not match the open element
    #[error("mismatched closing tag: expected </{expected}>, got </{actual}>")]
    MismatchedTag {
        /// Open element
        expected: String,
        /// Closing tag found
        actual: String,
    },

    /// Element is not part of the channel-zero vocabulary
    #[error("unexpected element <{0}>")]
    UnexpectedElement(String),

    /// Required attribute is absent
    #[error("<{element}> is missing attribute {attribute}")]
    MissingAttribute {
        /// Element name
        element: &'static str,
        /// Attribute name
        attribute: &'static str,
    },

    /// Required child element is absent
    #[error("<{parent}> must contain <{child}>")]
    MissingElement {
        /// Enclosing element
        parent: &'static str,
        /// Missing child element
        child: &'static str,
    },

    /// Attribute value is not valid
    #[error("invalid value for {attribute}: {value:?}")]
    InvalidAttribute {
        /// Attribute name
        attribute: &'static str,
        /// Offending value
        value: String,
    },

    /// Unknown character or entity reference
    #[error("unknown entity reference &{0};")]
    UnknownEntity(String),

    /// Payload was not UTF-8
    #[error("control message is not UTF-8")]
    NotUtf8,

    /// base64 profile content failed to decode
    #[error("invalid base64 content")]
    InvalidBase64,
}

impl ControlError {
    /// Convert to the `<error>` sent back to the peer
    #[must_use]
    pub fn to_beep_error(&self) -> BeepError {
        let code = match self {
            ControlError::UnexpectedElement(_)
            | ControlError::MissingAttribute { .. }
            | ControlError::MissingElement { .. } => ReplyCode::PARAMETER_ERROR,
            ControlError::InvalidAttribute { .. } | ControlError::InvalidBase64 => {
                ReplyCode::PARAMETER_INVALID
            }
            _ => ReplyCode::GENERAL_SYNTAX_ERROR,
        };
        BeepError::new(code, self.to_string())
    }
}

impl Error {
    /// Returns true if this error tears down the whole session
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Frame(_)
                | Error::Protocol(_)
                | Error::Io(_)
                | Error::Session(SessionError::Terminated(_) | SessionError::TransportClosed)
        )
    }

    /// Returns the peer-visible error, if this is one
    #[must_use]
    pub fn as_beep_error(&self) -> Option<&BeepError> {
        match self {
            Error::Beep(e) => Some(e),
            _ => None,
        }
    }
}
