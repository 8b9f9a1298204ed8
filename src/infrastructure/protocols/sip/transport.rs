//! SIP transport layer (UDP)

use super::message::SipError;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Largest SIP datagram accepted
pub const MAX_DATAGRAM: usize = 65_535;

/// Datagram transport used by the dispatcher
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram
    async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError>;

    /// Wait for the next datagram
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SipError>;

    fn local_addr(&self) -> Result<SocketAddr, SipError>;
}

/// UDP transport implementation
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, SipError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("SIP UDP transport listening on {}", socket.local_addr()?);
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: &[u8], destination: SocketAddr) -> Result<(), SipError> {
        self.socket.send_to(data, destination).await?;
        debug!("Sent {} bytes to {}", data.len(), destination);
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SipError> {
        let (len, source) = self.socket.recv_from(buf).await?;
        debug!("Received {} bytes from {}", len, source);
        Ok((len, source))
    }

    fn local_addr(&self) -> Result<SocketAddr, SipError> {
        Ok(self.socket.local_addr()?)
    }
}
