//! Low-level Bolt protocol building blocks: PackStream serialization,
//! message types, the version handshake, and chunked framing.
//!
//! Nothing in this layer touches sockets or drives state; the
//! [`driver`](crate::driver) layer owns connections and everything above
//! them.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod packstream;

pub use handshake::BoltVersion;
