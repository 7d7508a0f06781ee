//! Messages exchanged between group members.
//!
//! The message kind is decided once, at the transport boundary, by decoding
//! into the `GroupMessage` sum type. Encoding is bincode over serde.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::GroupError;
use crate::health_monitor::MemberState;
use crate::member::{MemberAdvertisement, MemberId};
use crate::view::ViewEvent;

/// A message together with the member that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MemberId,
    pub message: GroupMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    Health(HealthMessage),
    Master(MasterMessage),
}

// One member's liveness as seen by the reporter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub member: MemberAdvertisement,
    pub state: MemberState,
    pub seq: u64,
}

// Heartbeat traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMessage {
    pub source: MemberId,
    pub reports: Vec<HealthReport>,
    /// Latest master view id, stamped only by the master.
    pub master_view_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterMessageKind {
    ResendRequest { missed: Vec<u64> },
    MasterQuery,
    NodeQuery,
    NodeResponse,
    GroupStartupComplete { members: Vec<MemberAdvertisement> },
    MasterResponse { view: Vec<MemberAdvertisement>, event: Option<ViewEvent> },
    MasterAnnouncement { view: Vec<MemberAdvertisement>, event: Option<ViewEvent> },
    MasterCollision,
    ViewChange { view: Vec<MemberAdvertisement>, event: ViewEvent },
}

impl MasterMessageKind {
    pub fn name(&self) -> &'static str {
        match self {
            MasterMessageKind::ResendRequest { .. } => "resend-request",
            MasterMessageKind::MasterQuery => "master-query",
            MasterMessageKind::NodeQuery => "node-query",
            MasterMessageKind::NodeResponse => "node-response",
            MasterMessageKind::GroupStartupComplete { .. } => "group-startup-complete",
            MasterMessageKind::MasterResponse { .. } => "master-response",
            MasterMessageKind::MasterAnnouncement { .. } => "master-announcement",
            MasterMessageKind::MasterCollision => "master-collision",
            MasterMessageKind::ViewChange { .. } => "view-change",
        }
    }

    /// Authoritative views carry a master view id that must be applied in order.
    pub fn is_authoritative_view(&self) -> bool {
        matches!(
            self,
            MasterMessageKind::MasterResponse { .. }
                | MasterMessageKind::MasterAnnouncement { .. }
                | MasterMessageKind::ViewChange { .. }
        )
    }
}

// Master protocol traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterMessage {
    pub source: MemberAdvertisement,
    pub master_view_id: u64,
    pub kind: MasterMessageKind,
    /// Set when the master retransmits a buffered broadcast.
    pub resend: bool,
}

impl MasterMessage {
    pub fn new(source: MemberAdvertisement, master_view_id: u64, kind: MasterMessageKind) -> Self {
        Self {
            source,
            master_view_id,
            kind,
            resend: false,
        }
    }
}

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    bincode::serialize(envelope).map_err(|e| GroupError::Encode(e.to_string()).into())
}

pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    bincode::deserialize(bytes).map_err(|e| GroupError::Decode(e.to_string()).into())
}
