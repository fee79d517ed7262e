use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Actor's role does not allow the operation.
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("user is already an active participant")]
    AlreadyMember,

    #[error("user is not an active participant")]
    NotMember,

    /// The owner leaves only by transferring ownership or deleting the
    /// conversation, never via remove-participant.
    #[error("the conversation owner cannot be removed")]
    CannotRemoveOwner,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid p2p session transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("delivery retry budget exhausted after {0} attempts")]
    DeliveryExhausted(i64),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}
