//! Gossip Membership Library
//!
//! Peer membership and heartbeat-based failure detection for a set of independently
//! running nodes, built on an epidemic (gossip) protocol over UDP.
//! It serves as the foundation for the `gossip-node` binary (`main.rs`).
//!
//! ## Modules
//! - **`membership`**: Configuration, the per-node membership table, the UDP wire codec and
//!   the `GossipService` that runs the disseminator, receiver and failure detector loops.

pub mod membership;
