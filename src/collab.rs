//! The main-gateway collaborator contract.
//!
//! The main Discord text gateway is out of scope for this crate (its own
//! event loop, REST catalog, and model types live elsewhere); this module
//! defines only the narrow surface a [`crate::voice::VoiceSession`] needs
//! from it.

use crate::model::{ChannelId, GuildId, UserId};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Command sent over the main gateway to change this client's voice state.
#[derive(Debug, Clone)]
pub struct UpdateVoiceStateCommand {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// `VOICE_SERVER_UPDATE`, delivered after an `UpdateVoiceStateCommand`.
#[derive(Debug, Clone)]
pub struct VoiceServerUpdateEvent {
    pub guild_id: GuildId,
    pub endpoint: String,
    pub token: String,
}

/// `VOICE_STATE_UPDATE`, delivered after an `UpdateVoiceStateCommand` (and on
/// any subsequent mid-session voice-state change for this user).
#[derive(Debug, Clone)]
pub struct VoiceStateUpdateEvent {
    pub guild_id: GuildId,
    pub user_id: UserId,
    pub channel_id: Option<ChannelId>,
    pub session_id: String,
}

/// A channel as resolved by [`MainGateway::channel`]; only the fields the
/// voice session needs to discover a guild from a channel ID.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub guild_id: GuildId,
}

/// The bot's own identity, as resolved by [`MainGateway::me`].
#[derive(Debug, Clone)]
pub struct Me {
    pub user_id: UserId,
}

/// Handle returned by [`MainGateway::add_handler`]; detaches the handler on drop.
pub struct HandlerGuard {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl HandlerGuard {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        HandlerGuard {
            detach: Some(Box::new(detach)),
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// An event a registered handler may receive.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    VoiceServerUpdate(VoiceServerUpdateEvent),
    VoiceStateUpdate(VoiceStateUpdateEvent),
}

/// A typed callback registered with [`MainGateway::add_handler`].
pub type GatewayHandler = Box<dyn Fn(&GatewayEvent) + Send + Sync>;

/// The narrow surface this crate needs from the main gateway subsystem.
///
/// Implementations of this trait live outside this crate: it is the
/// boundary between the voice session and the (out-of-scope) main gateway
/// event loop.
#[async_trait]
pub trait MainGateway: Send + Sync {
    /// Transmit `command` over the main gateway.
    async fn send_gateway(
        &self,
        token: &CancellationToken,
        command: UpdateVoiceStateCommand,
    ) -> crate::Result<()>;

    /// Subscribe to main-gateway events; returns a guard that detaches the
    /// handler on drop so a session can deterministically unregister on leave.
    fn add_handler(&self, handler: GatewayHandler) -> HandlerGuard;

    /// Resolve a channel to find its guild.
    async fn channel(&self, id: ChannelId) -> crate::Result<Channel>;

    /// The bot's own identity.
    async fn me(&self) -> crate::Result<Me>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// An in-memory `MainGateway` double for exercising join/leave flows
    /// without a real main gateway connection.
    pub struct MockMainGateway {
        pub guild_id: GuildId,
        pub user_id: UserId,
        handlers: Mutex<Vec<Arc<GatewayHandler>>>,
        pub sent: Mutex<Vec<UpdateVoiceStateCommand>>,
    }

    impl MockMainGateway {
        pub fn new(guild_id: GuildId, user_id: UserId) -> Self {
            MockMainGateway {
                guild_id,
                user_id,
                handlers: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Simulate the main gateway delivering `event` to every live handler.
        pub fn deliver(&self, event: GatewayEvent) {
            for handler in self.handlers.lock().unwrap().iter() {
                handler(&event);
            }
        }
    }

    #[async_trait]
    impl MainGateway for MockMainGateway {
        async fn send_gateway(
            &self,
            _token: &CancellationToken,
            command: UpdateVoiceStateCommand,
        ) -> crate::Result<()> {
            self.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn add_handler(&self, handler: GatewayHandler) -> HandlerGuard {
            let handler = Arc::new(handler);
            self.handlers.lock().unwrap().push(handler);
            // the mock never actually detaches (test-scoped, short lived);
            // a real implementation removes the handler from its registry here.
            HandlerGuard::new(|| {})
        }

        async fn channel(&self, id: ChannelId) -> crate::Result<Channel> {
            Ok(Channel {
                id,
                guild_id: self.guild_id,
            })
        }

        async fn me(&self) -> crate::Result<Me> {
            Ok(Me {
                user_id: self.user_id,
            })
        }
    }
}
