//! Identifiers and state shared between the main-gateway collaborator
//! contract and the voice session.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! snowflake {
    ($(#[$attr:meta] $name:ident;)*) => {
        $(
            #[$attr]
            #[derive(Copy, Clone, Hash, Eq, PartialEq, Debug, Ord, PartialOrd)]
            #[derive(Serialize, Deserialize)]
            pub struct $name(#[serde(deserialize_with = "crate::serial::deserialize_id")] pub u64);

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    }
}

snowflake! {
    /// An identifier for a guild (server).
    GuildId;
    /// An identifier for a channel.
    ChannelId;
    /// An identifier for a user.
    UserId;
}

bitflags! {
    /// Main-gateway intents this crate requires to receive voice events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intents: u32 {
        const GUILDS = 1 << 0;
        const GUILD_VOICE_STATES = 1 << 7;
    }
}

impl Default for Intents {
    fn default() -> Self {
        Intents::GUILDS | Intents::GUILD_VOICE_STATES
    }
}

/// Session input/output state, mutable and guarded by the session's own lock.
///
/// Before a voice-gateway dial, all six fields must be populated; `user_id`
/// is constant for the lifetime of a session; `channel_id == None` indicates
/// a leave.
#[derive(Debug, Clone, Default)]
pub struct VoiceState {
    pub guild_id: Option<GuildId>,
    pub channel_id: Option<ChannelId>,
    pub user_id: Option<UserId>,
    pub session_id: Option<String>,
    pub token: Option<String>,
    pub endpoint: Option<String>,
}

impl VoiceState {
    /// True once every field required to dial the voice gateway is present.
    pub fn ready_to_dial(&self) -> bool {
        self.guild_id.is_some()
            && self.user_id.is_some()
            && self.session_id.is_some()
            && self.token.is_some()
            && self.endpoint.is_some()
    }
}
