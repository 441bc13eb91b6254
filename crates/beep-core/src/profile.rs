//! Profile registry.
//!
//! Maps profile URIs to the [`StartChannelListener`] that decides whether a
//! channel with that profile may start or close. Each session carries its
//! own copy, taken when the session is built.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::channel::Channel;
use crate::control::{Greeting, ProfileEncoding};
use crate::error::BeepError;
use crate::session::Session;
use crate::tuning::TuningProperties;

/// Application hook for channels of one profile
pub trait StartChannelListener: Send + Sync {
    /// Whether the profile is listed in the greeting of `session`
    fn advertise_profile(&self, _session: &Session) -> bool {
        true
    }

    /// Accept or refuse a channel the peer asked to start
    ///
    /// `data` is the content of the peer's `<profile>` element, if any. The
    /// listener typically installs a request handler on `channel` here.
    ///
    /// # Errors
    ///
    /// The returned error is sent to the peer as the start reply.
    fn start_channel(
        &self,
        channel: &Channel,
        encoding: ProfileEncoding,
        data: Option<&Bytes>,
    ) -> Result<(), BeepError>;

    /// Accept or refuse closing `channel`
    ///
    /// # Errors
    ///
    /// The returned error vetoes the close.
    fn close_channel(&self, _channel: &Channel) -> Result<(), BeepError> {
        Ok(())
    }
}

#[derive(Clone)]
struct ProfileEntry {
    listener: Arc<dyn StartChannelListener>,
    required: TuningProperties,
}

/// Registered profiles, keyed by URI
#[derive(Clone, Default)]
pub struct ProfileRegistry {
    entries: BTreeMap<String, ProfileEntry>,
}

impl ProfileRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `uri`, returning the listener it replaces
    pub fn register(
        &mut self,
        uri: impl Into<String>,
        listener: Arc<dyn StartChannelListener>,
    ) -> Option<Arc<dyn StartChannelListener>> {
        self.register_with_properties(uri, listener, TuningProperties::new())
    }

    /// Register a profile that may only start once `required` holds
    pub fn register_with_properties(
        &mut self,
        uri: impl Into<String>,
        listener: Arc<dyn StartChannelListener>,
        required: TuningProperties,
    ) -> Option<Arc<dyn StartChannelListener>> {
        self.entries
            .insert(uri.into(), ProfileEntry { listener, required })
            .map(|entry| entry.listener)
    }

    /// Remove `uri`, returning its listener
    pub fn unregister(&mut self, uri: &str) -> Option<Arc<dyn StartChannelListener>> {
        self.entries.remove(uri).map(|entry| entry.listener)
    }

    /// Registered URIs
    #[must_use]
    pub fn profiles(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// True if `uri` is registered
    #[must_use]
    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    /// Properties `uri` requires
    #[must_use]
    pub fn required_properties(&self, uri: &str) -> Option<&TuningProperties> {
        self.entries.get(uri).map(|entry| &entry.required)
    }

    /// Listener for `uri`, if registered and its requirements all hold
    #[must_use]
    pub fn lookup(
        &self,
        uri: &str,
        negotiated: &TuningProperties,
    ) -> Option<Arc<dyn StartChannelListener>> {
        self.entries
            .get(uri)
            .filter(|entry| entry.required.satisfied_by(negotiated))
            .map(|entry| entry.listener.clone())
    }

    /// Listener for `uri` regardless of requirements
    #[must_use]
    pub fn listener(&self, uri: &str) -> Option<Arc<dyn StartChannelListener>> {
        self.entries.get(uri).map(|entry| entry.listener.clone())
    }

    /// URIs to list in the greeting of `session`
    #[must_use]
    pub fn advertised(&self, session: &Session) -> Vec<String> {
        let negotiated = session.tuning_properties();
        self.entries
            .iter()
            .filter(|(_, entry)| entry.required.partially_satisfied_by(&negotiated))
            .filter(|(_, entry)| entry.listener.advertise_profile(session))
            .map(|(uri, _)| uri.clone())
            .collect()
    }

    /// Greeting for `session`
    #[must_use]
    pub fn greeting(&self, session: &Session) -> Greeting {
        let config = session.config();
        Greeting {
            profiles: self.advertised(session),
            features: config.features.clone(),
            localize: config.localize.clone(),
        }
    }
}

impl fmt::Debug for ProfileRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileRegistry")
            .field("profiles", &self.profiles())
            .finish()
    }
}
