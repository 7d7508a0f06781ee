pub mod broadcast;
pub mod config;
pub mod election;
pub mod error;
pub mod group;
pub mod health_monitor;
pub mod logging;
pub mod member;
pub mod message;
pub mod transport;
pub mod view;
pub mod view_manager;

#[cfg(test)]
mod tests;

pub use config::GroupConfig;
pub use error::GroupError;
pub use group::{GroupContext, GroupService, StopKind};
pub use health_monitor::MemberState;
pub use member::{MemberAdvertisement, MemberId};
pub use view::{ClusterView, ViewEvent, ViewEventKind, ViewListener};
