use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::member::{MemberAdvertisement, MemberId};

// Kinds of cluster view change delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewEventKind {
    Add,
    PeerStop,
    ClusterStop,
    MasterChange,
    InDoubt,
    Failure,
    NoLongerInDoubt,
    JoinedAndReady,
}

impl ViewEventKind {
    /// Events that end an incarnation's membership.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ViewEventKind::Failure | ViewEventKind::PeerStop | ViewEventKind::ClusterStop
        )
    }
}

impl std::fmt::Display for ViewEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViewEventKind::Add => write!(f, "ADD_EVENT"),
            ViewEventKind::PeerStop => write!(f, "PEER_STOP_EVENT"),
            ViewEventKind::ClusterStop => write!(f, "CLUSTER_STOP_EVENT"),
            ViewEventKind::MasterChange => write!(f, "MASTER_CHANGE_EVENT"),
            ViewEventKind::InDoubt => write!(f, "IN_DOUBT_EVENT"),
            ViewEventKind::Failure => write!(f, "FAILURE_EVENT"),
            ViewEventKind::NoLongerInDoubt => write!(f, "NO_LONGER_INDOUBT_EVENT"),
            ViewEventKind::JoinedAndReady => write!(f, "JOINED_AND_READY_EVENT"),
        }
    }
}

// One logical membership change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewEvent {
    pub kind: ViewEventKind,
    pub member: MemberAdvertisement,
    /// Start time of the previous incarnation when the member rejoined after a restart.
    pub previous_start_time: Option<u64>,
}

impl ViewEvent {
    pub fn new(kind: ViewEventKind, member: MemberAdvertisement) -> Self {
        Self {
            kind,
            member,
            previous_start_time: None,
        }
    }

    pub fn with_previous_start_time(mut self, previous_start_time: Option<u64>) -> Self {
        self.previous_start_time = previous_start_time;
        self
    }

    pub fn is_rejoin(&self) -> bool {
        self.previous_start_time.is_some()
    }
}

/// Immutable, id-ordered snapshot of the known members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    members: BTreeMap<MemberId, MemberAdvertisement>,
    view_id: u64,
    master_view_id: u64,
    master: Option<MemberId>,
}

impl ClusterView {
    pub fn new(
        members: BTreeMap<MemberId, MemberAdvertisement>,
        view_id: u64,
        master_view_id: u64,
        master: Option<MemberId>,
    ) -> Self {
        Self {
            members,
            view_id,
            master_view_id,
            master,
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn master_view_id(&self) -> u64 {
        self.master_view_id
    }

    pub fn master(&self) -> Option<&MemberId> {
        self.master.as_ref()
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn get(&self, id: &MemberId) -> Option<&MemberAdvertisement> {
        self.members.get(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberAdvertisement> {
        self.members.values()
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.members.keys().cloned().collect()
    }

    pub fn to_vec(&self) -> Vec<MemberAdvertisement> {
        self.members.values().cloned().collect()
    }
}

/// Callback invoked synchronously for every view change.
pub type ViewListener = Arc<dyn Fn(&ViewEvent, &ClusterView) + Send + Sync>;
