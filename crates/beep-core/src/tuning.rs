//! Tuning resets.
//!
//! A tuning profile (TLS, SASL with a security layer) renegotiates the byte
//! stream underneath a session. Once the exchange on its channel is done, the
//! session hands the raw stream to a [`TuningHandshake`], which returns the
//! transformed stream plus the credentials and properties it established.
//! The transport then continues with a fresh session on top of the new
//! stream.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::error::Error;
use crate::frame::SeqFrame;
use crate::session::Session;

/// Longest line still taken for a window update ahead of handshake bytes
const MAX_SEQ_LINE: usize = 64;

/// Security properties a tuning reset established on a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TuningProperties {
    properties: BTreeMap<String, String>,
}

impl TuningProperties {
    /// Traffic is encrypted
    pub const ENCRYPTION: &'static str = "ENCRYPTION";
    /// Anonymous authentication is not allowed
    pub const NO_ANONYMOUS: &'static str = "NO_ANONYMOUS";
    /// Plain-text authentication mechanisms are not allowed
    pub const NO_PLAIN_TEXT: &'static str = "NO_PLAIN_TEXT";
    /// Mechanisms open to active attacks are not allowed
    pub const NO_ACTIVE: &'static str = "NO_ACTIVE";
    /// Personal (per-user) credentials are required
    pub const PERSONAL: &'static str = "PERSONAL";

    /// No properties
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`set`](Self::set)
    #[must_use]
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.set(name, value);
        self
    }

    /// Set a property
    pub fn set(&mut self, name: &str, value: &str) {
        self.properties.insert(name.to_string(), value.to_string());
    }

    /// Look up a property
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// True if no property is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Iterate over name/value pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Add every property of `other`, overriding ours on conflict
    pub fn merge(&mut self, other: &TuningProperties) {
        for (name, value) in other.iter() {
            self.set(name, value);
        }
    }

    /// True if every property here holds in `negotiated`
    #[must_use]
    pub fn satisfied_by(&self, negotiated: &TuningProperties) -> bool {
        self.iter()
            .all(|(name, value)| negotiated.get(name) == Some(value))
    }

    /// True if there is nothing to satisfy, or at least one property holds
    #[must_use]
    pub fn partially_satisfied_by(&self, negotiated: &TuningProperties) -> bool {
        self.is_empty()
            || self
                .iter()
                .any(|(name, value)| negotiated.get(name) == Some(value))
    }
}

/// Identity established by a tuning profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredential {
    /// Profile or mechanism that produced the credential
    pub mechanism: String,
    /// Authenticated identity
    pub authenticator: String,
    /// Identity acted on behalf of, if different
    pub authorized: Option<String>,
    /// Cipher or algorithm in use, for encrypting profiles
    pub algorithm: Option<String>,
    /// Remote address, when known
    pub remote_address: Option<String>,
}

impl SessionCredential {
    /// Credential for `authenticator` established by `mechanism`
    pub fn new(mechanism: impl Into<String>, authenticator: impl Into<String>) -> Self {
        Self {
            mechanism: mechanism.into(),
            authenticator: authenticator.into(),
            authorized: None,
            algorithm: None,
            remote_address: None,
        }
    }

    /// Set the authorization identity
    #[must_use]
    pub fn with_authorized(mut self, authorized: impl Into<String>) -> Self {
        self.authorized = Some(authorized.into());
        self
    }

    /// Set the algorithm
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = Some(algorithm.into());
        self
    }
}

impl fmt::Display for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mechanism, self.authenticator)?;
        if let Some(authorized) = &self.authorized {
            write!(f, " as {authorized}")?;
        }
        Ok(())
    }
}

/// Byte stream a session can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// Type-erased [`ByteStream`]
pub type BoxedStream = Box<dyn ByteStream>;

/// Raw stream handed to a tuning handshake
///
/// Bytes the transport had already read past the last frame come first.
/// SEQ frames the peer wrote before it switched over are dropped from the
/// front of the stream.
pub struct TuningStream {
    io: BoxedStream,
    read_buf: BytesMut,
    leading: bool,
}

impl TuningStream {
    /// Wrap a stream with bytes already read from it
    #[must_use]
    pub fn new(io: BoxedStream, read_buf: BytesMut) -> Self {
        Self {
            io,
            read_buf,
            leading: true,
        }
    }

    /// Drop one window update from the front of the buffer
    ///
    /// `None` means more bytes are needed to tell.
    fn skip_window_update(&mut self) -> Option<bool> {
        const PREFIX: &[u8] = b"SEQ ";
        let n = self.read_buf.len().min(PREFIX.len());
        if self.read_buf[..n] != PREFIX[..n] {
            return Some(false);
        }
        let Some(end) = self.read_buf.windows(2).position(|w| w == b"\r\n") else {
            return (self.read_buf.len() > MAX_SEQ_LINE).then_some(false);
        };
        let Some(seq) = std::str::from_utf8(&self.read_buf[..end])
            .ok()
            .and_then(|line| SeqFrame::parse(line).ok())
        else {
            return Some(false);
        };
        tracing::debug!(
            "Dropping SEQ {} {} {} sent ahead of the tuning handshake",
            seq.channel,
            seq.ackno,
            seq.window
        );
        self.read_buf.advance(end + 2);
        Some(true)
    }

    /// Bytes buffered ahead of the underlying stream
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }

    /// Give back the stream and any unread buffered bytes
    #[must_use]
    pub fn into_parts(self) -> (BoxedStream, BytesMut) {
        (self.io, self.read_buf)
    }
}

impl AsyncRead for TuningStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.leading {
            match self.skip_window_update() {
                Some(true) => {}
                Some(false) => self.leading = false,
                None => {
                    let mut chunk = [0u8; MAX_SEQ_LINE];
                    let mut more = ReadBuf::new(&mut chunk);
                    ready!(Pin::new(&mut self.io).poll_read(cx, &mut more))?;
                    if more.filled().is_empty() {
                        self.leading = false;
                    }
                    self.read_buf.extend_from_slice(more.filled());
                }
            }
        }
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for TuningStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// What a completed handshake established
#[derive(Debug, Clone, Default)]
pub struct TuningOutcome {
    /// Our identity, if the handshake authenticated us
    pub local_credential: Option<SessionCredential>,
    /// Peer identity, if the handshake authenticated the peer
    pub peer_credential: Option<SessionCredential>,
    /// Properties to add to the new session
    pub properties: TuningProperties,
}

/// Transforms the raw stream during a tuning reset
#[async_trait]
pub trait TuningHandshake: Send {
    /// Run the handshake over `stream`
    ///
    /// # Errors
    ///
    /// Any error aborts the session.
    async fn handshake(
        &mut self,
        stream: TuningStream,
    ) -> Result<(BoxedStream, TuningOutcome), Error>;
}

/// Request from a session to its transport to perform a reset
pub struct TuneRequest {
    /// Handshake to run over the raw stream
    pub handshake: Box<dyn TuningHandshake>,
    /// Session being retired
    pub session: Session,
    /// Receives the session that replaces it
    pub done: oneshot::Sender<Result<Session, Error>>,
}

impl fmt::Debug for TuneRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TuneRequest")
            .field("session", &self.session.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_properties_satisfaction() {
        let required = TuningProperties::new().with(TuningProperties::ENCRYPTION, "true");
        let none = TuningProperties::new();
        let tls = TuningProperties::new()
            .with(TuningProperties::ENCRYPTION, "true")
            .with(TuningProperties::NO_PLAIN_TEXT, "true");

        assert!(!required.satisfied_by(&none));
        assert!(required.satisfied_by(&tls));
        assert!(none.satisfied_by(&none));
        assert!(none.partially_satisfied_by(&none));

        let both = tls.clone().with(TuningProperties::PERSONAL, "true");
        assert!(!both.satisfied_by(&tls));
        assert!(both.partially_satisfied_by(&tls));
        assert!(!both.partially_satisfied_by(&none));
    }

    #[test]
    fn test_properties_merge() {
        let mut base = TuningProperties::new().with(TuningProperties::ENCRYPTION, "false");
        base.merge(&TuningProperties::new().with(TuningProperties::ENCRYPTION, "true"));
        assert_eq!(base.get(TuningProperties::ENCRYPTION), Some("true"));
    }

    #[test]
    fn test_credential_display() {
        let credential = SessionCredential::new("PLAIN", "alice").with_authorized("bob");
        assert_eq!(credential.to_string(), "PLAIN:alice as bob");
    }

    #[tokio::test]
    async fn test_tuning_stream_drops_leading_window_updates() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut stream = TuningStream::new(Box::new(near), BytesMut::from(&b"SEQ 0 12"[..]));

        far.write_all(b"0 48\r\nSEQ 1 0 4096\r\nHELLO\nSEQ 0 1 1\r\n")
            .await
            .unwrap();
        drop(far);

        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "HELLO\nSEQ 0 1 1\r\n");
    }

    #[tokio::test]
    async fn test_tuning_stream_keeps_non_seq_lines() {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let mut stream = TuningStream::new(Box::new(near), BytesMut::from(&b"SEQUEL\r\n"[..]));
        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "SEQUEL\r\n");
    }

    #[tokio::test]
    async fn test_tuning_stream_reads_buffer_first() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut stream = TuningStream::new(Box::new(near), BytesMut::from(&b"early"[..]));
        assert_eq!(stream.buffered(), 5);

        far.write_all(b" late").await.unwrap();
        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early late");

        stream.write_all(b"back").await.unwrap();
        let mut echo = [0u8; 4];
        far.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"back");
    }
}
