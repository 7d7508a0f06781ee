use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{Prober, Transport};
use crate::error::GroupError;
use crate::member::{MemberAdvertisement, MemberId};
use crate::message::{self, Envelope, GroupMessage};

#[derive(Debug, Default)]
struct PeerSlot {
    listeners: Vec<mpsc::UnboundedSender<Envelope>>,
    connected: bool,
}

/// In-process network connecting `MemoryTransport`s.
///
/// Every hop is bincode encoded and decoded. A disconnected member neither
/// sends nor receives, which makes it look crashed or partitioned to its peers.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    peers: Mutex<HashMap<MemberId, PeerSlot>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a member to the network and return its transport.
    pub fn transport(self: &Arc<Self>, id: &MemberId) -> Arc<MemoryTransport> {
        {
            let mut peers = self.peers();
            let slot = peers.entry(id.clone()).or_default();
            slot.connected = true;
        }
        Arc::new(MemoryTransport {
            id: id.clone(),
            network: self.clone(),
            routes: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn disconnect(&self, id: &MemberId) {
        if let Some(slot) = self.peers().get_mut(id) {
            slot.connected = false;
        }
    }

    pub fn reconnect(&self, id: &MemberId) {
        if let Some(slot) = self.peers().get_mut(id) {
            slot.connected = true;
        }
    }

    pub fn is_up(&self, id: &MemberId) -> bool {
        self.peers().get(id).map(|slot| slot.connected).unwrap_or(false)
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<MemberId, PeerSlot>> {
        match self.peers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn add_listener(&self, id: &MemberId, listener: mpsc::UnboundedSender<Envelope>) {
        self.peers().entry(id.clone()).or_default().listeners.push(listener);
    }

    fn deliver(&self, to: &MemberId, bytes: &[u8]) -> Result<()> {
        let mut peers = self.peers();
        let slot = peers
            .get_mut(to)
            .ok_or_else(|| GroupError::UnknownPeer(to.clone()))?;
        if !slot.connected {
            return Err(GroupError::Disconnected(to.clone()).into());
        }
        let envelope = match message::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %to, "dropping undecodable message: {}", e);
                return Ok(());
            }
        };
        slot.listeners.retain(|listener| listener.send(envelope.clone()).is_ok());
        Ok(())
    }

    fn recipients(&self, from: &MemberId) -> Vec<MemberId> {
        self.peers()
            .iter()
            .filter(|(id, slot)| *id != from && slot.connected)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Prober for MemoryNetwork {
    async fn is_reachable(&self, member: &MemberAdvertisement, _timeout: Duration) -> bool {
        self.is_up(&member.id)
    }
}

/// One member's endpoint on a `MemoryNetwork`.
#[derive(Debug)]
pub struct MemoryTransport {
    id: MemberId,
    network: Arc<MemoryNetwork>,
    routes: Mutex<BTreeSet<MemberId>>,
}

impl MemoryTransport {
    pub fn id(&self) -> &MemberId {
        &self.id
    }

    /// Member ids this transport currently holds routing for.
    pub fn routes(&self) -> Vec<MemberId> {
        match self.routes.lock() {
            Ok(routes) => routes.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    fn envelope(&self, message: GroupMessage) -> Result<Vec<u8>> {
        message::encode(&Envelope {
            from: self.id.clone(),
            message,
        })
    }

    fn ensure_up(&self) -> Result<()> {
        if self.network.is_up(&self.id) {
            Ok(())
        } else {
            Err(GroupError::Disconnected(self.id.clone()).into())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &MemberId, message: GroupMessage) -> Result<()> {
        self.ensure_up()?;
        let bytes = self.envelope(message)?;
        trace!(from = %self.id, to = %peer, len = bytes.len(), "send");
        self.network.deliver(peer, &bytes)
    }

    async fn broadcast(&self, message: GroupMessage) -> Result<()> {
        self.ensure_up()?;
        let bytes = self.envelope(message)?;
        for peer in self.network.recipients(&self.id) {
            // best effort: a peer going away mid-broadcast is not an error
            let _ = self.network.deliver(&peer, &bytes);
        }
        Ok(())
    }

    fn add_message_listener(&self, listener: mpsc::UnboundedSender<Envelope>) {
        self.network.add_listener(&self.id, listener);
    }

    async fn is_connected(&self, peer: &MemberId) -> bool {
        self.network.is_up(&self.id) && self.network.is_up(peer)
    }

    fn add_remote_peer(&self, member: &MemberAdvertisement) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(member.id.clone());
        }
    }

    fn remove_peer(&self, peer: &MemberId) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(peer);
        }
    }
}
