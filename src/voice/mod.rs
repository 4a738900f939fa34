//! Voice session orchestration: the WebSocket control plane ([`gateway`]),
//! the UDP media plane ([`connection`]), and the op-code wire format
//! ([`op`]), tied together by [`VoiceSession`].

pub mod connection;
pub mod gateway;
pub mod op;
pub mod session;

pub use connection::VoiceConnection;
pub use gateway::{Dispatch, VoiceCredentials, VoiceGatewayClient};
pub use op::{Op, VoiceEvent};
pub use session::VoiceSession;
