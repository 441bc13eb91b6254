//! Connection driver.
//!
//! One task owns the byte stream. It waits on two sources at once: the
//! session's outbound queue (frames to write, ingest toggles, tuning and
//! shutdown requests), and, while ingestion is enabled, the next decoded
//! frame from the stream. Outbound work is handled strictly in queue order,
//! so a reply queued before a tuning request is on the wire before the
//! handshake starts.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use beep_core::session::Outbound;
use beep_core::tuning::TuneRequest;
use beep_core::{
    BoxedStream, FrameCodec, ProfileRegistry, Role, Session, SessionBuilder, SessionHandle,
    TuningStream, WireFrame,
};

use crate::TransportConfig;
use crate::error::{TransportError, TransportResult};

/// A running connection: its driver task and a handle on its session
pub struct Connection {
    handle: SessionHandle,
    task: JoinHandle<TransportResult<()>>,
    peer_addr: Option<std::net::SocketAddr>,
}

impl Connection {
    /// Run a session over `io` and exchange greetings
    ///
    /// # Errors
    ///
    /// Returns the greeting failure; the driver has shut down by then.
    pub async fn establish<S>(
        io: S,
        role: Role,
        config: &TransportConfig,
        registry: ProfileRegistry,
    ) -> TransportResult<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, outbound) = SessionBuilder::new(role)
            .config(config.session.clone())
            .registry(registry)
            .build();
        let handle = session.handle();
        let codec = FrameCodec::new().with_max_frame_size(config.max_frame_size);
        let task = tokio::spawn(drive(Box::new(io), session.clone(), outbound, codec));

        session.init().await?;
        tracing::debug!("Session {} established as {:?}", session.id(), role);
        Ok(Self {
            handle,
            task,
            peer_addr: None,
        })
    }

    pub(crate) fn with_peer_addr(mut self, addr: Option<std::net::SocketAddr>) -> Self {
        self.peer_addr = addr;
        self
    }

    /// Session currently running on the connection
    #[must_use]
    pub fn session(&self) -> Session {
        self.handle.current()
    }

    /// Handle that follows the connection across tuning resets
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Remote address, for socket connections
    #[must_use]
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.peer_addr
    }

    /// True once the driver task has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the session in an orderly way and wait for the driver to exit
    ///
    /// # Errors
    ///
    /// Fails if the close is refused or the driver failed.
    pub async fn close(self) -> TransportResult<()> {
        self.session().close().await?;
        self.join().await
    }

    /// Wait for the driver to exit
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection, if any.
    pub async fn join(self) -> TransportResult<()> {
        self.task
            .await
            .map_err(|e| TransportError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.handle.current().id())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Drive `session` over `io` until shutdown or failure
///
/// # Errors
///
/// Returns the I/O, framing, or tuning error that ended the connection;
/// the session has been terminated by then.
pub async fn drive(
    io: BoxedStream,
    mut session: Session,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    codec: FrameCodec,
) -> TransportResult<()> {
    let mut framed = Framed::new(io, codec.clone());
    let mut ingest = false;

    loop {
        tokio::select! {
            biased;

            work = outbound.recv() => {
                let Some(work) = work else {
                    tracing::debug!("Session {} released its connection", session.id());
                    break;
                };
                match work {
                    Outbound::Frame(frame) => {
                        if let Err(e) = framed.send(frame).await {
                            session.terminate(&format!("write failed: {e}"));
                            return Err(e.into());
                        }
                    }
                    Outbound::Ingest(enabled) => {
                        tracing::trace!("Session {} ingest {}", session.id(), enabled);
                        ingest = enabled;
                    }
                    Outbound::Tune(request) => {
                        if let Err(e) = SinkExt::<WireFrame>::flush(&mut framed).await {
                            session.terminate(&format!("flush before tuning failed: {e}"));
                            return Err(e.into());
                        }
                        let parts = framed.into_parts();
                        let stream = TuningStream::new(parts.io, parts.read_buf);
                        let tuned = tune(request, stream).await?;
                        framed = Framed::new(tuned.io, codec.clone());
                        session = tuned.session;
                        outbound = tuned.outbound;
                        ingest = false;
                    }
                    Outbound::Shutdown => {
                        if let Err(e) = SinkExt::<WireFrame>::flush(&mut framed).await {
                            session.terminate(&format!("flush on shutdown failed: {e}"));
                            return Err(e.into());
                        }
                        if let Err(e) = framed.get_mut().shutdown().await {
                            tracing::debug!("Shutdown of session {} stream: {}", session.id(), e);
                        }
                        tracing::debug!("Session {} connection shut down", session.id());
                        break;
                    }
                }
            }

            frame = framed.next(), if ingest => {
                match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = session.post_wire_frame(frame) {
                            tracing::warn!("Session {} protocol failure: {}", session.id(), e);
                            return Err(e.into());
                        }
                    }
                    Some(Err(e)) => {
                        session.terminate(&format!("bad frame: {e}"));
                        return Err(e.into());
                    }
                    None => {
                        if !session.state().is_terminal() {
                            session.terminate("connection closed by peer");
                        }
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// What the driver continues with after a reset
struct Tuned {
    io: BoxedStream,
    session: Session,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

async fn tune(request: TuneRequest, stream: TuningStream) -> TransportResult<Tuned> {
    let TuneRequest {
        mut handshake,
        session,
        done,
    } = request;
    tracing::debug!(
        "Session {} tuning handshake ({} bytes buffered)",
        session.id(),
        stream.buffered()
    );

    match handshake.handshake(stream).await {
        Ok((io, outcome)) => {
            let (next, outbound) = session.successor(outcome);
            if done.send(Ok(next.clone())).is_err() {
                tracing::debug!("Session {} no longer waiting for its reset", session.id());
            }
            Ok(Tuned {
                io,
                session: next,
                outbound,
            })
        }
        Err(e) => {
            let reason = e.to_string();
            tracing::warn!("Session {} tuning failed: {}", session.id(), reason);
            let _ = done.send(Err(e));
            Err(TransportError::Tuning(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beep_core::{
        BeepError, Channel, Error, Message, ProfileEncoding, ReplyCode, RequestHandler,
        SessionState, StartChannelListener, TuningHandshake, TuningOutcome,
    };
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

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

    struct EchoProfile;

    impl StartChannelListener for EchoProfile {
        fn start_channel(
            &self,
            channel: &Channel,
            _encoding: ProfileEncoding,
            _data: Option<&bytes::Bytes>,
        ) -> Result<(), BeepError> {
            channel.set_request_handler(Arc::new(Echo));
            Ok(())
        }
    }

    async fn pair() -> (Connection, Connection) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let mut registry = ProfileRegistry::new();
        registry.register(ECHO, Arc::new(EchoProfile));
        let config = TransportConfig::default();

        let (client, server) = tokio::join!(
            Connection::establish(near, Role::Initiator, &config, ProfileRegistry::new()),
            Connection::establish(far, Role::Listener, &config, registry),
        );
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_echo_over_duplex() {
        let (client, server) = pair().await;
        assert_eq!(client.session().peer_profiles(), vec![ECHO.to_string()]);

        let channel = client.session().start_channel(ECHO, None).await.unwrap();
        let reply = channel.request("hello").await.unwrap();
        assert_eq!(&reply.read_to_end().await.unwrap()[..], b"hello");

        client.close().await.unwrap();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_disconnect_terminates_session() {
        let (client, server) = pair().await;
        let session = client.session();

        server.session().terminate("going away");
        server.join().await.unwrap();
        client.join().await.unwrap();
        assert_eq!(session.state(), SessionState::Aborted);
    }

    /// Duplex end whose writes and flushes fail once `broken` is set
    struct Breakable {
        io: DuplexStream,
        broken: Arc<AtomicBool>,
    }

    impl Breakable {
        fn check(&self) -> io::Result<()> {
            if self.broken.load(Ordering::SeqCst) {
                Err(io::ErrorKind::BrokenPipe.into())
            } else {
                Ok(())
            }
        }
    }

    impl AsyncRead for Breakable {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Breakable {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.check()?;
            Pin::new(&mut self.io).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.check()?;
            Pin::new(&mut self.io).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.io).poll_shutdown(cx)
        }
    }

    struct Refuse;

    #[async_trait]
    impl TuningHandshake for Refuse {
        async fn handshake(
            &mut self,
            _stream: TuningStream,
        ) -> Result<(BoxedStream, TuningOutcome), Error> {
            Err(BeepError::new(ReplyCode::AUTHENTICATION_FAILURE, "refused").into())
        }
    }

    #[tokio::test]
    async fn test_flush_failure_before_tuning_terminates_session() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let broken = Arc::new(AtomicBool::new(false));
        let near = Breakable {
            io: near,
            broken: broken.clone(),
        };
        let config = TransportConfig::default();
        let (client, server) = tokio::join!(
            Connection::establish(near, Role::Initiator, &config, ProfileRegistry::new()),
            Connection::establish(far, Role::Listener, &config, ProfileRegistry::new()),
        );
        let (client, _server) = (client.unwrap(), server.unwrap());
        let session = client.session();

        broken.store(true, Ordering::SeqCst);
        assert!(session.tune(Box::new(Refuse)).await.is_err());
        assert!(client.join().await.is_err());
        assert_eq!(session.state(), SessionState::Aborted);
        let reason = session.termination_reason().unwrap();
        assert!(reason.contains("flush before tuning failed"), "{reason}");
    }
}
