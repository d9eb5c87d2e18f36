use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::error::Result;

/// Transport is the shared bidirectional stream between the client and
/// its TURN server.
///
/// The stream is frame-oriented: every `recv` must yield exactly one
/// STUN message or one ChannelData frame, and every `send` carries one
/// complete frame. A connected UDP socket satisfies this naturally; a
/// stream transport (TCP, TLS) must be wrapped with length framing
/// before injection.
#[async_trait]
pub trait Transport {
    /// Receives a single inbound frame into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Sends a single frame, returning the number of bytes written.
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Closes the transport. Pending reads fail afterwards.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(UdpSocket::recv(self, buf).await?)
    }

    async fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(UdpSocket::send(self, buf).await?)
    }

    async fn close(&self) -> Result<()> {
        // Dropping the socket closes it; nothing to flush for UDP.
        Ok(())
    }
}
