//! Protocol profile table, control/input codec, bounded invalidation queue,
//! and connection quality monitor for the GameStream control channel.
//!
//! This crate is transport- and threading-agnostic: it has no sockets and
//! spawns no threads. `streamctl-transport` and `streamctl-session` build
//! on top of it.

pub mod codec;
pub mod error;
pub mod invalidation;
pub mod profile;
pub mod quality;

pub use error::{CoreError, CoreResult};
