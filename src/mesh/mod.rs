//! Peer mesh counter store using Chitchat.
//!
//! Lets several rate limiter instances share quotas without an external
//! cache. It uses the chitchat library for gossip-based cluster membership
//! and state dissemination.

mod cluster;
mod store;

pub use cluster::{Cluster, ClusterConfig, ClusterError, CounterEntry};
pub use store::MeshCounterStore;
