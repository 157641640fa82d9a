use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtomicError {
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid count: {0}")]
    InvalidCount(String),

    #[error("already counted down to zero")]
    AlreadyCountedDown,

    #[error("cannot queue work after shutdown")]
    EnqueuedWorkAfterShutdown,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("value rejected by share hook: {0}")]
    ValueRejected(String),

    #[error("share hook already installed")]
    HookAlreadyInstalled,
}

impl AtomicError {
    /// True for errors raised because a caller broke an operation's protocol.
    /// The primitive that raised it stays valid and usable.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            AtomicError::AlreadyCountedDown | AtomicError::EnqueuedWorkAfterShutdown
        )
    }
}

pub type Result<T> = std::result::Result<T, AtomicError>;
