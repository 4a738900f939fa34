//! The voice protocol engine for a Discord client: the voice gateway state
//! machine, the UDP media plane, and the concurrency primitives (context-aware
//! mutex, pacemaker, REST rate limiter) the rest of the crate rests on.
//!
//! This crate does not speak to Discord's main gateway or REST catalog
//! itself — it is driven by a [`collab::MainGateway`] implementation supplied
//! by the caller, and communicates back through [`VoiceSession`](voice::VoiceSession).

#![warn(missing_docs)]

pub mod collab;
pub mod config;
pub mod error;
pub mod model;
pub mod ratelimit;
mod serial;
pub mod sync;
pub mod transport;
pub mod voice;

pub use config::SessionConfig;
pub use error::{Error, Result};
pub use voice::VoiceSession;
