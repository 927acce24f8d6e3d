//! The hub-side driver for one attached peer.

use std::io;
use std::sync::Arc;

use patchbay_session::ConnectionError;
use patchbay_wire::{ErrorKind, ErrorRecord, Packet, PacketTransport};
use tokio::sync::mpsc;
use tracing::warn;

use crate::hub::{HubShared, PeerId};

/// One peer's connection loop: relays inbound packets into the router and
/// drains the router's outbound queue onto the transport.
///
/// Must be spawned (or awaited). On any exit path the peer is disposed,
/// which fans disconnect cleanup out to everyone entangled with it.
pub struct HubConnection<T> {
    shared: Arc<HubShared>,
    peer: PeerId,
    io: T,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl<T> HubConnection<T>
where
    T: PacketTransport,
{
    pub(crate) fn new(
        shared: Arc<HubShared>,
        peer: PeerId,
        io: T,
        rx: mpsc::UnboundedReceiver<Packet>,
    ) -> Self {
        Self {
            shared,
            peer,
            io,
            rx,
        }
    }

    /// Run until the peer hangs up or the transport fails.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;
        self.shared.dispose(self.peer);
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                packet = self.rx.recv() => {
                    let Some(packet) = packet else {
                        return Ok(());
                    };
                    self.send_outbound(packet).await?;
                }
                result = self.io.recv() => {
                    match result {
                        // Routing is synchronous; nothing here blocks the
                        // other select arm for long.
                        Ok(Some(packet)) => self.shared.route(self.peer, packet),
                        Ok(None) => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                            warn!(peer = self.peer, error = %e, "dropping undecodable frame");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    /// Put one queued packet on the wire. An encode or size fault costs
    /// only that packet; a terminal packet is downgraded to an error so
    /// the caller is not left hanging.
    async fn send_outbound(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let Err(e) = self.io.send(&packet).await else {
            return Ok(());
        };
        if !is_local_send_fault(&e) {
            return Err(e.into());
        }
        warn!(
            peer = self.peer,
            id = %packet.call_id(),
            error = %e,
            "forwarded packet did not encode"
        );
        if packet.is_terminal() {
            let fallback = Packet::Error {
                id: packet.call_id(),
                error: ErrorRecord::new(
                    ErrorKind::Wrapped,
                    &self.shared.config.name,
                    format!("result did not encode: {e}"),
                ),
            };
            self.io.send(&fallback).await?;
        }
        Ok(())
    }
}

fn is_local_send_fault(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput
    )
}
