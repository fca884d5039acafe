use ulid::Ulid;

use crate::model::{InvalidSpan, Span};
use crate::social::SocialError;

use super::reconcile::Rejection;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidSpan(InvalidSpan),
    /// Admission rejected: the requested window is not available.
    Unavailable {
        requested: Span,
        reason: &'static str,
    },
    /// The user has no rental on the property to throw a party for.
    NoActiveRental {
        user_id: Ulid,
        property_id: Ulid,
    },
    Social(SocialError),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn rejected(requested: Span, rejection: Rejection) -> Self {
        let reason = match rejection {
            Rejection::ContainedBy(_) => "already listed",
            Rejection::TrimmedAway => "no free days left after trimming",
        };
        EngineError::Unavailable { requested, reason }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidSpan(e) => write!(f, "invalid span: {e}"),
            EngineError::Unavailable { requested, reason } => write!(
                f,
                "window [{}, {}] is unavailable: {reason}",
                requested.start, requested.end
            ),
            EngineError::NoActiveRental {
                user_id,
                property_id,
            } => write!(f, "user {user_id} has no upcoming rental at {property_id}"),
            EngineError::Social(e) => write!(f, "{e}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<InvalidSpan> for EngineError {
    fn from(e: InvalidSpan) -> Self {
        EngineError::InvalidSpan(e)
    }
}

impl From<SocialError> for EngineError {
    fn from(e: SocialError) -> Self {
        EngineError::Social(e)
    }
}
