//! Membership & Failure Detection Module
//!
//! Implements an epidemic (gossip) membership protocol over UDP. Every node keeps its own
//! view of the cluster and converges with the others without any coordinator.
//!
//! ## Core Mechanisms
//! - **Heartbeat Dissemination**: Each node periodically bumps its own heartbeat counter and
//!   pushes it to `fanout` randomly chosen peers.
//! - **Anti-Entropy Merge**: Received heartbeats are merged by taking the maximum, so duplicate
//!   and reordered datagrams are harmless.
//! - **Failure Detection**: A peer whose heartbeat has not advanced for `failure_timeout` is
//!   marked failed, and forgotten after a further `cleanup_timeout`.

pub mod config;
pub mod events;
pub mod service;
pub mod table;
pub mod transport;
pub mod types;
