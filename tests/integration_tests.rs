//! End-to-end session tests.
//!
//! Two sessions talk over an in-memory pipe through the real connection
//! driver; flow-control tests script one side with a raw frame peer.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use beep_core::{
    BeepError, ControlMessage, DeliveryStatus, Message, MessageType, ProfileElement,
    ProfileEncoding, ProfileRegistry, ReplyCode, ReplyCollector, RequestHandler, Role,
    SessionConfig, SessionEvent, SessionState, StartChannelListener, TuningProperties,
};
use beep_integration_tests::{
    ECHO, EchoProfile, LineHandshake, RawPeer, STEP_TIMEOUT, TUNE, TuneProfile, control_message,
    echo_registry, eventually, pair,
};
use beep_transport::{Connection, Listener, TransportConfig, connect};

// ============================================================================
// Channel Management
// ============================================================================

/// Channels started by the initiator are odd, by the listener even.
#[tokio::test]
async fn test_start_channel_numbering() {
    let (client, server) = pair(echo_registry(), echo_registry(), &TransportConfig::default()).await;

    let ours = client.session().start_channel(ECHO, None).await.unwrap();
    assert_eq!(ours.number(), 1);
    assert_eq!(ours.state(), beep_core::ChannelState::Active);
    assert_eq!(ours.profile().as_deref(), Some(ECHO));

    let theirs = server.session().start_channel(ECHO, None).await.unwrap();
    assert_eq!(theirs.number(), 2);

    let next = client.session().start_channel(ECHO, None).await.unwrap();
    assert_eq!(next.number(), 3);

    assert_eq!(
        server
            .session()
            .channels()
            .iter()
            .map(|c| c.number())
            .collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// A MSG answered with RPY reaches the reply listener exactly once.
#[tokio::test]
async fn test_ping_pong() {
    let (client, server) = pair(ProfileRegistry::new(), echo_registry(), &TransportConfig::default()).await;
    let channel = client.session().start_channel(ECHO, None).await.unwrap();

    let (collector, mut replies) = ReplyCollector::new();
    let status = channel.send_msg("ping", Some(collector)).unwrap();

    let reply = timeout(STEP_TIMEOUT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.message_type(), MessageType::Rpy);
    assert_eq!(reply.msgno(), status.msgno());
    assert_eq!(&reply.read_to_end().await.unwrap()[..], b"pong");

    assert!(eventually(|| status.status() == DeliveryStatus::ReceivedReply).await);
    assert!(replies.try_recv().is_err());

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// Starting a profile the peer does not offer fails with 550.
#[tokio::test]
async fn test_unsupported_profile() {
    let (client, server) = pair(ProfileRegistry::new(), echo_registry(), &TransportConfig::default()).await;

    let err = client
        .session()
        .start_channel("http://example.org/beep/unknown", None)
        .await
        .unwrap_err();
    let beep = err.as_beep_error().expect("peer error");
    assert_eq!(beep.code, ReplyCode::REQUESTED_ACTION_REFUSED);
    assert_eq!(beep.diagnostic, "all requested profiles are unsupported");

    // The failed start leaves no channel behind and the session usable
    assert!(client.session().channel(1).is_none());
    let channel = client.session().start_channel(ECHO, None).await.unwrap();
    assert_eq!(channel.number(), 3);

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// The first acceptable candidate wins; its piggybacked request is answered
/// inside the `<profile>` reply.
#[tokio::test]
async fn test_start_with_candidates_and_piggyback() {
    let (client, server) = pair(ProfileRegistry::new(), echo_registry(), &TransportConfig::default()).await;

    let channel = client
        .session()
        .start_channel_with(
            vec![
                ProfileElement::new("http://example.org/beep/unknown"),
                ProfileElement::new(ECHO).with_content("ping", ProfileEncoding::None),
            ],
            None,
        )
        .await
        .unwrap();
    assert_eq!(channel.profile().as_deref(), Some(ECHO));
    assert_eq!(channel.start_data(), Some(Bytes::from_static(b"pong")));

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// Closing a channel removes it on both sides and emits events.
#[tokio::test]
async fn test_channel_close() {
    let (client, server) = pair(ProfileRegistry::new(), echo_registry(), &TransportConfig::default()).await;
    let mut events = server.session().subscribe();

    let channel = client.session().start_channel(ECHO, None).await.unwrap();
    channel.request("ping").await.unwrap();
    channel.close().await.unwrap();

    assert_eq!(channel.state(), beep_core::ChannelState::Closed);
    assert!(client.session().channel(1).is_none());
    assert!(eventually(|| server.session().channel(1).is_none()).await);

    let mut seen = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        seen.push(event);
    }
    assert!(seen.contains(&SessionEvent::ChannelStarted {
        number: 1,
        profile: ECHO.to_string()
    }));
    assert!(seen.contains(&SessionEvent::ChannelClosed { number: 1 }));

    client.close().await.unwrap();
    server.join().await.unwrap();
}

// ============================================================================
// Replies
// ============================================================================

/// Answers every MSG with three ANS and a NUL
struct Counter;

#[async_trait]
impl RequestHandler for Counter {
    async fn receive_msg(&self, message: Message) -> Result<(), BeepError> {
        let fail = |e: beep_core::Error| {
            BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string())
        };
        message.read_to_end().await.map_err(fail)?;
        for n in 0..3u32 {
            message.answer(format!("answer {n}")).map_err(fail)?;
        }
        message.reply_nul().map_err(fail)
    }
}

struct CounterProfile;

impl StartChannelListener for CounterProfile {
    fn start_channel(
        &self,
        channel: &beep_core::Channel,
        _encoding: ProfileEncoding,
        _data: Option<&Bytes>,
    ) -> Result<(), BeepError> {
        channel.set_request_handler(Arc::new(Counter));
        Ok(())
    }
}

#[tokio::test]
async fn test_one_to_many_answers() {
    const COUNTER: &str = "http://example.org/beep/counter";
    let mut registry = ProfileRegistry::new();
    registry.register(COUNTER, Arc::new(CounterProfile));
    let (client, server) = pair(ProfileRegistry::new(), registry, &TransportConfig::default()).await;

    let channel = client.session().start_channel(COUNTER, None).await.unwrap();
    let (collector, mut replies) = ReplyCollector::new();
    let status = channel.send_msg("count", Some(collector)).unwrap();

    for n in 0..3u32 {
        let answer = timeout(STEP_TIMEOUT, replies.recv()).await.unwrap().unwrap();
        assert_eq!(answer.message_type(), MessageType::Ans);
        assert_eq!(answer.ansno(), Some(n));
        assert_eq!(answer.read_to_end().await.unwrap(), format!("answer {n}").as_bytes());
    }
    let nul = timeout(STEP_TIMEOUT, replies.recv()).await.unwrap().unwrap();
    assert_eq!(nul.message_type(), MessageType::Nul);
    assert!(eventually(|| status.status() == DeliveryStatus::ReceivedReply).await);

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// Large messages cross many frames and window updates intact.
#[tokio::test]
async fn test_large_message_with_small_window() {
    let session = SessionConfig::default()
        .with_window_size(512)
        .with_frame_size(128);
    let config = TransportConfig::default().with_session(session);
    let (client, server) = pair(ProfileRegistry::new(), echo_registry(), &config).await;

    let channel = client.session().start_channel(ECHO, None).await.unwrap();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let reply = timeout(STEP_TIMEOUT, channel.request(payload.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.read_to_end().await.unwrap(), payload);

    let stats = channel.stats();
    assert_eq!(stats.sent_sequence, 100_000);
    assert_eq!(stats.recv_sequence, 100_000);

    client.close().await.unwrap();
    server.join().await.unwrap();
}

// ============================================================================
// Flow Control
// ============================================================================

/// A window well under the default still carries the greeting, the channel
/// start and messages much larger than the window, with full-size frames
/// allowed.
#[tokio::test]
async fn test_window_below_default_with_default_frame_size() {
    let session = SessionConfig::default().with_window_size(48);
    let config = TransportConfig::default().with_session(session);
    let (client, server) = pair(ProfileRegistry::new(), echo_registry(), &config).await;
    assert_eq!(client.session().state(), SessionState::Active);

    let channel = client.session().start_channel(ECHO, None).await.unwrap();
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 239) as u8).collect();
    let reply = timeout(STEP_TIMEOUT, channel.request(payload.clone()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.read_to_end().await.unwrap(), payload);

    let ours = channel.stats();
    assert_eq!(ours.recv_sequence, 10_000);
    assert_eq!(ours.used, 0);
    assert_eq!(ours.window, 48);

    let theirs = server.session().channel(1).unwrap().stats();
    assert_eq!(theirs.recv_sequence, 10_000);
    assert!(theirs.used <= theirs.window);

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// A 20-byte MSG against a 10-byte window: 10 bytes go out, the rest waits
/// for the peer's SEQ.
#[tokio::test]
async fn test_window_holds_back_excess_bytes() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let mut raw = RawPeer::new(far);
    let config = TransportConfig::default();
    let (client, greeting) = tokio::join!(
        Connection::establish(near, Role::Initiator, &config, ProfileRegistry::new()),
        raw.greet(&[ECHO]),
    );
    let client = client.unwrap();
    assert!(greeting.profiles.is_empty());
    let session = client.session();
    assert_eq!(session.peer_profiles(), vec![ECHO.to_string()]);

    let starting = tokio::spawn({
        let session = session.clone();
        async move { session.start_channel(ECHO, None).await }
    });
    let start = raw.next_data().await;
    assert_eq!((start.message_type(), start.channel()), (MessageType::Msg, 0));
    match control_message(&start) {
        ControlMessage::Start(request) => assert_eq!(request.number, 1),
        other => panic!("expected <start>, got {other:?}"),
    }
    raw.send_control(
        MessageType::Rpy,
        start.msgno(),
        &ControlMessage::Profile(ProfileElement::new(ECHO)),
    )
    .await;
    let channel = starting.await.unwrap().unwrap();

    raw.send_seq(1, 0, 10).await;
    assert!(eventually(|| channel.stats().peer_window == 10).await);

    let status = channel.send_msg(vec![b'x'; 20], None).unwrap();
    let first = raw.next_data().await;
    assert_eq!(first.header().build(), "MSG 1 1 * 0 10\r\n");
    assert!(raw.is_idle(Duration::from_millis(100)).await);
    assert_eq!(status.status(), DeliveryStatus::NotSent);
    assert_eq!(channel.stats().peer_window, 0);

    raw.send_seq(1, 10, 10).await;
    let second = raw.next_data().await;
    assert_eq!(second.header().build(), "MSG 1 1 . 10 10\r\n");
    assert!(eventually(|| status.status() == DeliveryStatus::Sent).await);

    raw.send(MessageType::Rpy, 1, 1, "done").await;
    assert!(eventually(|| status.status() == DeliveryStatus::ReceivedReply).await);
}

/// Frames that break sequence numbering end the session.
#[tokio::test]
async fn test_sequence_gap_is_fatal() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let mut raw = RawPeer::new(far);
    let config = TransportConfig::default();
    let (client, _) = tokio::join!(
        Connection::establish(near, Role::Initiator, &config, ProfileRegistry::new()),
        raw.greet(&[]),
    );
    let client = client.unwrap();
    let session = client.session();

    // The peer's greeting already used channel-zero seqno 0
    let frame = beep_core::FrameBuilder::new()
        .message_type(MessageType::Msg)
        .channel(0)
        .msgno(1)
        .seqno(0)
        .payload("<ok />")
        .build()
        .unwrap();
    raw.send_raw(frame).await;

    assert!(client.join().await.is_err());
    assert_eq!(session.state(), SessionState::Aborted);
}

// ============================================================================
// Session Lifecycle
// ============================================================================

/// A tuning reset replaces the session: a fresh greeting exchange, the
/// negotiated credentials, and the connection handle following along.
#[tokio::test]
async fn test_tuning_reset() {
    let (tune, mut tuned) = TuneProfile::new("server");
    let mut registry = echo_registry();
    registry.register(TUNE, Arc::new(tune));
    let (client, server) = pair(ProfileRegistry::new(), registry, &TransportConfig::default()).await;

    let old = client.session();
    let mut events = old.subscribe();
    old.start_channel(TUNE, None).await.unwrap();

    let next = timeout(
        STEP_TIMEOUT,
        old.tune(Box::new(LineHandshake::new(Role::Initiator, "client"))),
    )
    .await
    .unwrap()
    .unwrap();
    let server_next = timeout(STEP_TIMEOUT, tuned.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(old.state(), SessionState::Closed);
    assert_eq!(next.state(), SessionState::Active);
    assert_ne!(next.id(), old.id());
    assert_eq!(client.session().id(), next.id());
    assert_eq!(server.session().id(), server_next.id());

    assert_eq!(
        next.peer_credential().map(|c| c.to_string()),
        Some("LINE:server".to_string())
    );
    assert_eq!(
        server_next.peer_credential().map(|c| c.to_string()),
        Some("LINE:client".to_string())
    );
    assert_eq!(
        next.tuning_properties().get(TuningProperties::PERSONAL),
        Some("true")
    );
    assert!(next.peer_profiles().contains(&ECHO.to_string()));
    assert!(next.channel(1).is_none());

    let mut reset = None;
    while let Ok(Ok(event)) = timeout(STEP_TIMEOUT, events.recv()).await {
        if let SessionEvent::Reset { old: from, new } = event {
            reset = Some((from, new));
            break;
        }
    }
    assert_eq!(reset, Some((old.id(), next.id())));

    let channel = next.start_channel(ECHO, None).await.unwrap();
    assert_eq!(channel.number(), 1);
    let reply = channel.request("ping").await.unwrap();
    assert_eq!(&reply.read_to_end().await.unwrap()[..], b"pong");

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// With a window smaller than the `<profile>` reply, the listener has to
/// wait for a SEQ before the reply is complete, and must keep reading frames
/// until it has been written.
#[tokio::test]
async fn test_tuning_reset_with_held_back_reply() {
    let (tune, mut tuned) = TuneProfile::new("server");
    let mut registry = echo_registry();
    registry.register(TUNE, Arc::new(tune));
    let session = SessionConfig::default().with_window_size(48);
    let config = TransportConfig::default().with_session(session);
    let (client, server) = pair(ProfileRegistry::new(), registry, &config).await;

    let old = client.session();
    let zero = old.channel(0).unwrap();
    timeout(STEP_TIMEOUT, old.start_channel(TUNE, None))
        .await
        .unwrap()
        .unwrap();
    assert!(zero.stats().used <= zero.stats().window);

    let next = timeout(
        STEP_TIMEOUT,
        old.tune(Box::new(LineHandshake::new(Role::Initiator, "client"))),
    )
    .await
    .unwrap()
    .unwrap();
    let server_next = timeout(STEP_TIMEOUT, tuned.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(next.state(), SessionState::Active);
    assert_eq!(
        server_next.peer_credential().map(|c| c.to_string()),
        Some("LINE:client".to_string())
    );

    let channel = next.start_channel(ECHO, None).await.unwrap();
    let reply = channel.request("ping").await.unwrap();
    assert_eq!(&reply.read_to_end().await.unwrap()[..], b"pong");

    client.close().await.unwrap();
    server.join().await.unwrap();
}

/// Orderly close from either side shuts both drivers down.
#[tokio::test]
async fn test_session_close_from_listener() {
    let (client, server) = pair(ProfileRegistry::new(), echo_registry(), &TransportConfig::default()).await;
    let session = client.session();

    server.close().await.unwrap();
    client.join().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

/// Sessions over real TCP sockets, several channels in parallel.
#[tokio::test]
async fn test_tcp_parallel_channels() {
    let listener = Listener::bind("127.0.0.1:0", TransportConfig::default(), echo_registry())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let incoming = listener.accept().await.unwrap();
        incoming.establish().await.unwrap().join().await
    });

    let client = connect(addr, &TransportConfig::default(), ProfileRegistry::new())
        .await
        .unwrap();
    let session = client.session();

    let mut tasks = Vec::new();
    for n in 0..4u32 {
        let channel = session.start_channel(ECHO, None).await.unwrap();
        tasks.push(tokio::spawn(async move {
            for i in 0..8u32 {
                let text = format!("channel {n} message {i}");
                let reply = channel.request(text.clone()).await.unwrap();
                assert_eq!(reply.read_to_end().await.unwrap(), text.as_bytes());
            }
            channel.close().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    client.close().await.unwrap();
    server.await.unwrap().unwrap();
}

/// Profiles registered with required properties stay hidden until a reset
/// establishes them.
#[tokio::test]
async fn test_profile_requires_tuning_properties() {
    let mut registry = ProfileRegistry::new();
    registry.register_with_properties(
        ECHO,
        Arc::new(EchoProfile),
        TuningProperties::new().with(TuningProperties::ENCRYPTION, "true"),
    );
    let (client, server) = pair(ProfileRegistry::new(), registry, &TransportConfig::default()).await;

    assert!(client.session().peer_profiles().is_empty());
    let err = client.session().start_channel(ECHO, None).await.unwrap_err();
    assert_eq!(
        err.as_beep_error().map(|e| e.code),
        Some(ReplyCode::REQUESTED_ACTION_REFUSED)
    );

    client.close().await.unwrap();
    server.join().await.unwrap();
}
