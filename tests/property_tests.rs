//! Property-based tests for BEEP
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Frame Header Properties
// ============================================================================

mod header_properties {
    use super::*;
    use beep_core::MessageType;
    use beep_core::frame::{FrameHeader, MAX_NUMBER};

    fn message_type() -> impl Strategy<Value = MessageType> {
        prop_oneof![
            Just(MessageType::Msg),
            Just(MessageType::Rpy),
            Just(MessageType::Err),
            Just(MessageType::Ans),
            Just(MessageType::Nul),
        ]
    }

    proptest! {
        /// Any in-range header survives build then parse
        #[test]
        fn header_roundtrip(
            message_type in message_type(),
            channel in 0..=MAX_NUMBER,
            msgno in 0..=MAX_NUMBER,
            more in any::<bool>(),
            seqno in any::<u32>(),
            size in 0..=MAX_NUMBER,
            ansno in 0..=MAX_NUMBER,
        ) {
            let header = FrameHeader {
                message_type,
                channel,
                msgno,
                more,
                seqno,
                size,
                ansno: (message_type == MessageType::Ans).then_some(ansno),
            };
            let line = header.build();
            prop_assert!(line.ends_with("\r\n"));
            prop_assert_eq!(FrameHeader::parse(&line).unwrap(), header);
        }

        /// Channel numbers beyond 2^31-1 are rejected
        #[test]
        fn header_rejects_out_of_range_channel(channel in (MAX_NUMBER + 1)..=u32::MAX) {
            let line = format!("MSG {channel} 0 . 0 0");
            prop_assert!(FrameHeader::parse(&line).is_err());
        }
    }
}

// ============================================================================
// Flow Control Properties
// ============================================================================

mod window_properties {
    use super::*;
    use beep_core::{SessionConfig, WireFrame};
    use beep_integration_tests::{ECHO, eventually, raw_channel};
    use beep_transport::TransportConfig;
    use std::time::Duration;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// The sender never puts more bytes on the wire than the receiver
        /// granted, never exceeds its frame size, and numbers every octet
        /// consecutively.
        #[test]
        fn sender_respects_window(
            window in 1u32..64,
            frame_size in 1usize..48,
            len in 1usize..300,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let received = runtime.block_on(async move {
                let config = TransportConfig::default()
                    .with_session(SessionConfig::default().with_frame_size(frame_size));
                let (_connection, mut raw, channel) = raw_channel(&config, ECHO).await;

                raw.send_seq(1, 0, window).await;
                assert!(eventually(|| channel.stats().peer_window == window).await);
                let mut granted = window;
                let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
                channel.send_msg(payload.clone(), None).unwrap();

                let mut received = Vec::new();
                loop {
                    let consumed = u32::try_from(received.len()).unwrap();
                    if consumed == granted {
                        raw.send_seq(1, consumed, window).await;
                        granted = consumed + window;
                    }
                    let frame = match raw.next_within(Duration::from_millis(250)).await {
                        Some(WireFrame::Data(frame)) => frame,
                        Some(WireFrame::Seq(_)) => continue,
                        None => {
                            // Sender is waiting on a partly used window
                            raw.send_seq(1, consumed, window).await;
                            granted = consumed + window;
                            continue;
                        }
                    };
                    assert_eq!(frame.channel(), 1);
                    assert_eq!(frame.seqno(), consumed);
                    assert!(frame.size() <= frame_size);
                    received.extend_from_slice(&frame.payload_bytes());
                    assert!(u32::try_from(received.len()).unwrap() <= granted);
                    if frame.is_last() {
                        break;
                    }
                }
                assert_eq!(received, payload);
                received
            });
            prop_assert_eq!(received.len(), len);
        }
    }
}
