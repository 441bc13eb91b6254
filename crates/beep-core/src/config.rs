//! Session configuration.

use std::time::Duration;

use crate::channel::DEFAULT_WINDOW_SIZE;

/// Session configuration parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Receive window advertised on every channel (bytes)
    pub window_size: u32,
    /// Largest payload put in one outbound frame (bytes)
    pub frame_size: usize,
    /// How long to wait for the peer's greeting
    pub greeting_timeout: Duration,
    /// How often the greeting wait re-checks the session state
    pub greeting_poll_interval: Duration,
    /// `localize` attribute of the greeting
    pub localize: Option<String>,
    /// `features` attribute of the greeting
    pub features: Option<String>,
    /// `serverName` sent with the first start request
    pub server_name: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            frame_size: 4096,
            greeting_timeout: Duration::from_secs(30),
            greeting_poll_interval: Duration::from_millis(250),
            localize: None,
            features: None,
            server_name: None,
        }
    }
}

impl SessionConfig {
    /// Set the receive window
    #[must_use]
    pub fn with_window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }

    /// Set the outbound frame payload limit
    #[must_use]
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Set the greeting timeout
    #[must_use]
    pub fn with_greeting_timeout(mut self, timeout: Duration) -> Self {
        self.greeting_timeout = timeout;
        self
    }

    /// Set the `serverName` for the first start request
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}
