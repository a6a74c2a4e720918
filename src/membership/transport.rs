//! UDP Transport & Wire Codec
//!
//! One datagram carries exactly one bincode-encoded `GossipMessage`. The encoded size is
//! capped at `MAX_MESSAGE_SIZE`; the receive buffer is one byte larger so that an
//! oversized datagram shows up as an error instead of being silently truncated.

use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;
use tokio::net::UdpSocket;

use super::types::{GossipMessage, MembershipRecord};

/// Largest encoded message accepted on the wire, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode gossip message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode gossip message: {0}")]
    Decode(#[source] bincode::Error),

    #[error("message of {len} bytes exceeds the {} byte limit", MAX_MESSAGE_SIZE)]
    Oversized { len: usize },

    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn encode(message: &GossipMessage) -> Result<Vec<u8>, TransportError> {
    let bytes = bincode::serialize(message).map_err(TransportError::Encode)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::Oversized { len: bytes.len() });
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<GossipMessage, TransportError> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(TransportError::Oversized { len: bytes.len() });
    }
    bincode::deserialize(bytes).map_err(TransportError::Decode)
}

/// Converts a decoded message into a fresh record stamped with `now`.
pub fn to_record(message: &GossipMessage, now: Instant) -> Result<MembershipRecord, TransportError> {
    let address = message
        .socket_addr()
        .ok_or_else(|| TransportError::InvalidAddress(message.host.clone()))?;
    Ok(MembershipRecord::new(address, message.heartbeat, now))
}

pub struct Transport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl Transport {
    /// Binds the node's listen socket. Port 0 picks a free port; see `local_addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;

        tracing::debug!("Gossip transport bound to {}", local_addr);

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encodes `record` and sends it as a single datagram. No delivery confirmation.
    pub async fn send(
        &self,
        target: SocketAddr,
        record: &MembershipRecord,
    ) -> Result<(), TransportError> {
        let encoded = encode(&GossipMessage::from(record))?;
        self.socket.send_to(&encoded, target).await?;
        Ok(())
    }

    /// Waits for one datagram and decodes it.
    ///
    /// Returns the advertised record together with the datagram's source address.
    pub async fn receive(&self) -> Result<(MembershipRecord, SocketAddr), TransportError> {
        let mut buf = [0u8; MAX_MESSAGE_SIZE + 1];
        let (len, src) = self.socket.recv_from(&mut buf).await?;

        let message = decode(&buf[..len])?;
        let record = to_record(&message, Instant::now())?;

        Ok((record, src))
    }
}
