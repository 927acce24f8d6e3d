//! Packet transport abstraction.
//!
//! [`PacketTransport`] abstracts over whatever carries packets between two
//! peers. Byte streams get framing from [`crate::LengthPrefixedFramed`];
//! message-oriented transports (e.g. WebSocket) can implement the trait
//! directly since they already delimit messages.

use std::io;

use crate::Packet;

/// Trait for transports that can send and receive whole packets.
///
/// The async methods require `Send` so drivers can run on multi-threaded
/// executors.
pub trait PacketTransport: Send {
    /// Send a packet over the transport.
    fn send(&mut self, packet: &Packet) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// Receive a packet.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly. A
    /// decode failure for a single packet surfaces as
    /// `io::ErrorKind::InvalidData` and must leave the transport usable for
    /// subsequent packets.
    fn recv(&mut self) -> impl std::future::Future<Output = io::Result<Option<Packet>>> + Send;
}
