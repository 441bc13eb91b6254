//! # BEEP Core
//!
//! Core implementation of the Blocks Extensible Exchange Protocol
//! (RFC 3080) over a reliable byte stream (RFC 3081).
//!
//! This crate provides:
//! - Frame encoding and decoding, including SEQ window updates
//! - The channel engine: message numbering, reassembly, flow control
//! - The session state machine and the channel-zero management protocol
//! - Profile registration and tuning resets
//!
//! It is transport-agnostic: a [`Session`] emits [`session::Outbound`] work
//! and consumes decoded frames, and a driver (see `beep-transport`) moves
//! them over a socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session                                  │
//! │   (greeting, channel table, start/close, tuning resets)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Channels                                 │
//! │   (numbered conversations, one profile each, windowed)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Frames                                   │
//! │   (MSG/RPY/ERR/ANS/NUL data frames and SEQ updates)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod control;
pub mod error;
pub mod frame;
pub mod message;
pub mod payload;
pub mod profile;
pub mod session;
pub mod tuning;

pub use channel::{Channel, ChannelState, ChannelStats, DEFAULT_WINDOW_SIZE};
pub use config::SessionConfig;
pub use control::{ControlMessage, Greeting, ProfileElement, ProfileEncoding};
pub use error::{BeepError, Error, ReplyCode, Result};
pub use frame::{Frame, FrameBuilder, FrameCodec, MessageType, SeqFrame, WireFrame};
pub use message::{
    DeliveryStatus, Message, MessageStatus, ReplyCollector, ReplyListener, RequestHandler,
};
pub use payload::{InputDataStream, MimeHeaders, OutputDataStream};
pub use profile::{ProfileRegistry, StartChannelListener};
pub use session::{
    Outbound, Role, Session, SessionBuilder, SessionEvent, SessionHandle, SessionId, SessionState,
};
pub use tuning::{
    BoxedStream, SessionCredential, TuningHandshake, TuningOutcome, TuningProperties,
    TuningStream,
};
