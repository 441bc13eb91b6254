//! # BEEP Transport
//!
//! Moves BEEP sessions over reliable byte streams (RFC 3081).
//!
//! This crate provides:
//! - The connection driver: one task per connection that writes the
//!   session's outbound frames in order and feeds it the frames it reads
//! - Stream hand-off for tuning resets
//! - TCP connect and listen helpers
//!
//! Any `AsyncRead + AsyncWrite` stream works with
//! [`Connection::establish`]; TCP is just the usual case.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod driver;
pub mod error;
pub mod tcp;

pub use driver::Connection;
pub use error::{TransportError, TransportResult};
pub use tcp::{Incoming, Listener, connect};

use beep_core::SessionConfig;
use beep_core::frame::DEFAULT_MAX_FRAME_SIZE;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Configuration for every session on the connection
    pub session: SessionConfig,
    /// Largest inbound frame payload accepted (bytes)
    pub max_frame_size: usize,
    /// Disable Nagle's algorithm on TCP sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            nodelay: true,
        }
    }
}

impl TransportConfig {
    /// Set the session configuration
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}
