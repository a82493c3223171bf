use crate::packet::OutboundPacket;
use map646_core::AddressFamily;
use std::io;
use std::task::{Context, Poll};

/// Transport for raw IP packets.
///
/// The gateway reads untranslated packets from it and writes translated
/// ones back. The tun device is the production implementation; tests use
/// in-memory channels.
pub trait PacketIO: Send + 'static {
    /// Poll for an incoming IP packet.
    ///
    /// Returns the packet's address family and the number of bytes read
    /// into `buf`.
    fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(AddressFamily, usize)>>;

    /// Write one translated packet.
    fn send(&mut self, packet: &OutboundPacket) -> io::Result<()>;
}
