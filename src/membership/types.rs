use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use super::config::GossipConfig;

/// Canonical `host:port` key of a peer in the membership table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Local view of a single peer's liveness.
///
/// `heartbeat` only ever grows. `failed` is derived from the time elapsed since
/// `last_update` and is recomputed by the failure detector, never by a message.
#[derive(Debug, Clone)]
pub struct MembershipRecord {
    pub address: SocketAddr,
    pub heartbeat: u64,
    pub last_update: Instant,
    pub failed: bool,
}

impl MembershipRecord {
    pub fn new(address: SocketAddr, heartbeat: u64, now: Instant) -> Self {
        Self {
            address,
            heartbeat,
            last_update: now,
            failed: false,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.address)
    }

    /// Advances the owning node's own counter. Only the disseminator calls this.
    pub fn increment_heartbeat(&mut self, now: Instant) {
        self.heartbeat += 1;
        self.last_update = now;
    }

    /// Anti-entropy merge: keeps the maximum heartbeat seen so far.
    ///
    /// Returns `true` if the record changed.
    pub fn merge(&mut self, incoming_heartbeat: u64, now: Instant) -> bool {
        if incoming_heartbeat > self.heartbeat {
            self.heartbeat = incoming_heartbeat;
            self.last_update = now;
            true
        } else {
            false
        }
    }

    /// Recomputes and returns `failed`. Exactly `failure_timeout` of silence is not a failure.
    pub fn check_failed(&mut self, now: Instant, config: &GossipConfig) -> bool {
        self.failed = now.saturating_duration_since(self.last_update) > config.failure_timeout;
        self.failed
    }

    pub fn should_cleanup(&self, now: Instant, config: &GossipConfig) -> bool {
        self.failed
            && now.saturating_duration_since(self.last_update)
                > config.failure_timeout + config.cleanup_timeout
    }
}

/// The single message type exchanged between nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipMessage {
    pub host: String,
    pub port: u16,
    pub heartbeat: u64,
}

impl GossipMessage {
    /// Returns `None` when `host` is not a literal IP address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<&MembershipRecord> for GossipMessage {
    fn from(record: &MembershipRecord) -> Self {
        Self {
            host: record.address.ip().to_string(),
            port: record.address.port(),
            heartbeat: record.heartbeat,
        }
    }
}
