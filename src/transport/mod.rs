//! Transport collaborators consumed by the group membership core.
//!
//! The core never opens sockets for protocol traffic itself; it talks to a
//! `Transport` for point-to-point and broadcast delivery and to a `Prober` for
//! the low-level reachability check used by failure detection.

mod memory;
mod probe;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use probe::TcpProber;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::member::{MemberAdvertisement, MemberId};
use crate::message::{Envelope, GroupMessage};

/// Message delivery used by every protocol component.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Reliable point-to-point delivery.
    async fn send(&self, peer: &MemberId, message: GroupMessage) -> Result<()>;

    /// Best-effort delivery to every other member.
    async fn broadcast(&self, message: GroupMessage) -> Result<()>;

    /// Register a sink for every inbound message.
    fn add_message_listener(&self, listener: mpsc::UnboundedSender<Envelope>);

    async fn is_connected(&self, peer: &MemberId) -> bool;

    /// Install routing for a member incarnation.
    fn add_remote_peer(&self, member: &MemberAdvertisement);

    /// Tear down routing for a member id.
    fn remove_peer(&self, peer: &MemberId);
}

/// Low-level reachability check for a suspected member.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn is_reachable(&self, member: &MemberAdvertisement, timeout: Duration) -> bool;
}
