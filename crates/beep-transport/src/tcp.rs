//! TCP mapping (RFC 3081).

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use beep_core::{ProfileRegistry, Role};

use crate::TransportConfig;
use crate::driver::Connection;
use crate::error::{TransportError, TransportResult};

/// Connect to a BEEP listener as the initiator and exchange greetings
///
/// # Errors
///
/// Returns `TransportError::ConnectionFailed` if the TCP connection cannot
/// be made, or the greeting failure.
pub async fn connect(
    addr: impl ToSocketAddrs,
    config: &TransportConfig,
    registry: ProfileRegistry,
) -> TransportResult<Connection> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    stream.set_nodelay(config.nodelay)?;
    let peer = stream.peer_addr().ok();
    tracing::info!("Connected to {:?}", peer);

    let connection = Connection::establish(stream, Role::Initiator, config, registry).await?;
    Ok(connection.with_peer_addr(peer))
}

/// Accepts BEEP connections as the listening peer
pub struct Listener {
    inner: TcpListener,
    config: TransportConfig,
    registry: ProfileRegistry,
}

impl Listener {
    /// Bind to `addr`; every accepted session gets a copy of `registry`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the address cannot be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: TransportConfig,
        registry: ProfileRegistry,
    ) -> TransportResult<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        tracing::info!("Listening on {:?}", inner.local_addr().ok());
        Ok(Self {
            inner,
            config,
            registry,
        })
    }

    /// Local address
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the address cannot be determined.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Wait for the next TCP connection
    ///
    /// The greeting exchange happens in [`Incoming::establish`], so a slow
    /// peer does not hold up the accept loop.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if accepting fails.
    pub async fn accept(&self) -> TransportResult<Incoming> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(self.config.nodelay)?;
        tracing::debug!("Accepted connection from {}", addr);
        Ok(Incoming {
            stream,
            addr,
            config: self.config.clone(),
            registry: self.registry.clone(),
        })
    }
}

/// An accepted TCP connection that has not exchanged greetings yet
pub struct Incoming {
    stream: TcpStream,
    addr: SocketAddr,
    config: TransportConfig,
    registry: ProfileRegistry,
}

impl Incoming {
    /// Remote address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the session and exchange greetings
    ///
    /// # Errors
    ///
    /// Returns the greeting failure.
    pub async fn establish(self) -> TransportResult<Connection> {
        let connection =
            Connection::establish(self.stream, Role::Listener, &self.config, self.registry)
                .await?;
        Ok(connection.with_peer_addr(Some(self.addr)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_accept() {
        let mut registry = ProfileRegistry::new();
        registry.register(
            "urn:test:none",
            std::sync::Arc::new(Refuse) as std::sync::Arc<dyn beep_core::StartChannelListener>,
        );
        let listener = Listener::bind("127.0.0.1:0", TransportConfig::default(), registry)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let incoming = listener.accept().await.unwrap();
            incoming.establish().await.unwrap()
        });
        let client = connect(addr, &TransportConfig::default(), ProfileRegistry::new())
            .await
            .unwrap();
        let server = server.await.unwrap();

        assert_eq!(client.peer_addr(), Some(addr));
        assert_eq!(client.session().peer_profiles(), vec!["urn:test:none".to_string()]);

        let err = client
            .session()
            .start_channel("urn:test:none", None)
            .await
            .unwrap_err();
        assert_eq!(
            err.as_beep_error().map(|e| e.code),
            Some(beep_core::ReplyCode::REQUESTED_ACTION_REFUSED)
        );

        client.close().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(addr, &TransportConfig::default(), ProfileRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    struct Refuse;

    impl beep_core::StartChannelListener for Refuse {
        fn start_channel(
            &self,
            _channel: &beep_core::Channel,
            _encoding: beep_core::ProfileEncoding,
            _data: Option<&bytes::Bytes>,
        ) -> Result<(), beep_core::BeepError> {
            Err(beep_core::BeepError::new(
                beep_core::ReplyCode::REQUESTED_ACTION_REFUSED,
                "not today",
            ))
        }
    }
}
