//! Error types for the synchronization host

/// Result type alias for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the controller and its collaborators.
///
/// None of these are fatal: the controller always has a path back to idle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Could not acquire or attach to the local player
    #[error("player handshake failed: {0}")]
    Handshake(String),

    /// The outbound channel rejected an update
    #[error("publish failed: {0}")]
    Publish(String),

    /// Credential renewal failed
    #[error("credential refresh failed: {0}")]
    Refresh(String),

    /// Operation not allowed in the controller's current state
    #[error("invalid controller state: {0}")]
    InvalidState(String),

    /// An internal task went away
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
