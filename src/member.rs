use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Custom tag under which every advertisement publishes its start time.
pub const START_TIME_TAG: &str = "start-time";

// Opaque, comparable member identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(format!("member-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Immutable description of one member incarnation.
///
/// Two advertisements with the same id but different start times describe a
/// restart of that member, not the same liveness lineage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAdvertisement {
    pub id: MemberId,
    pub name: String,
    /// Milliseconds since the unix epoch at which this incarnation started.
    pub start_time: u64,
    pub addresses: Vec<SocketAddr>,
    pub tags: BTreeMap<String, String>,
}

impl MemberAdvertisement {
    /// Advertisement for the local process, started now.
    pub fn new(name: &str, addresses: Vec<SocketAddr>) -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::with_start_time(MemberId::random(), name, start_time).with_addresses(addresses)
    }

    pub fn with_start_time(id: MemberId, name: &str, start_time: u64) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(START_TIME_TAG.to_string(), start_time.to_string());
        Self {
            id,
            name: name.to_string(),
            start_time,
            addresses: Vec::new(),
            tags,
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Start time as published in the custom tags, falling back to the field.
    pub fn advertised_start_time(&self) -> u64 {
        self.tag(START_TIME_TAG)
            .and_then(|value| value.parse().ok())
            .unwrap_or(self.start_time)
    }

    pub fn is_same_incarnation(&self, other: &MemberAdvertisement) -> bool {
        self.id == other.id && self.start_time == other.start_time
    }

    /// Seniority order: the earlier incarnation sorts first. Equal start times
    /// fall back to the id, where the greater id is the senior one.
    pub fn seniority_cmp(&self, other: &MemberAdvertisement) -> Ordering {
        self.advertised_start_time()
            .cmp(&other.advertised_start_time())
            .then_with(|| other.id.cmp(&self.id))
    }

    pub fn is_senior_to(&self, other: &MemberAdvertisement) -> bool {
        self.seniority_cmp(other) == Ordering::Less
    }
}

impl fmt::Display for MemberAdvertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}@{})", self.name, self.id, self.start_time)
    }
}

/// True when `incoming` is a newer incarnation of the member `cached` describes.
pub fn confirm_instance_has_restarted(cached: &MemberAdvertisement, incoming: &MemberAdvertisement) -> bool {
    cached.id == incoming.id && incoming.start_time > cached.start_time
}
