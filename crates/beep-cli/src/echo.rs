//! Echo profile: every MSG is answered with an RPY carrying the same payload.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use beep_core::{
    BeepError, Channel, Message, ProfileEncoding, ProfileRegistry, ReplyCode, RequestHandler,
    StartChannelListener,
};

/// Profile URI served by `beep serve`
pub const ECHO_PROFILE: &str = "http://xml.resource.org/profiles/NULL/ECHO";

/// Replies to each MSG with its own payload
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn receive_msg(&self, message: Message) -> Result<(), BeepError> {
        let data = message
            .read_to_end()
            .await
            .map_err(|e| BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()))?;
        tracing::debug!(
            "Echoing {} bytes on channel {} msgno {}",
            data.len(),
            message.channel().number(),
            message.msgno()
        );
        message
            .reply(data)
            .map_err(|e| BeepError::new(ReplyCode::REQUESTED_ACTION_ABORTED, e.to_string()))
    }
}

/// Accepts every start request for [`ECHO_PROFILE`]
pub struct EchoProfile;

impl StartChannelListener for EchoProfile {
    fn start_channel(
        &self,
        channel: &Channel,
        _encoding: ProfileEncoding,
        _data: Option<&Bytes>,
    ) -> Result<(), BeepError> {
        tracing::info!("Echo channel {} started", channel.number());
        channel.set_request_handler(Arc::new(EchoHandler));
        Ok(())
    }

    fn close_channel(&self, channel: &Channel) -> Result<(), BeepError> {
        tracing::info!("Echo channel {} closed", channel.number());
        Ok(())
    }
}

/// Registry offering only the echo profile
#[must_use]
pub fn registry() -> ProfileRegistry {
    let mut registry = ProfileRegistry::new();
    registry.register(ECHO_PROFILE, Arc::new(EchoProfile));
    registry
}
