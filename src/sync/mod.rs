//! Concurrency primitives the rest of the crate is built on: a
//! cancellation-aware mutex and a heartbeat pacemaker.

mod mutex;
mod pacemaker;

pub use mutex::CtxMutex;
pub use pacemaker::{EchoHandle, Pacemaker, StopHandle};
