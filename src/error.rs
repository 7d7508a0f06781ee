use crate::member::MemberId;

/// Typed failure causes raised by the group membership service.
///
/// Operations return `anyhow::Result`; these variants travel inside the
/// `anyhow::Error` and can be recovered with `downcast_ref::<GroupError>()`.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("message decode failed: {0}")]
    Decode(String),

    #[error("message encode failed: {0}")]
    Encode(String),

    #[error("member {0} is not known to the transport")]
    UnknownPeer(MemberId),

    #[error("member {0} is disconnected")]
    Disconnected(MemberId),

    #[error("operation requires the local member to be master")]
    NotMaster,

    #[error("group service is shutting down")]
    ShuttingDown,
}
