//! Typed error types for the tally-core service layer.

use thiserror::Error;

use crate::counter::StoreError;
use crate::model::{EntityId, ParseEnumError, VoterId};

/// Result type alias for core service operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the tally-core service layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The entity does not exist in the system of record.
    #[error("Entity not found: {entity_id}")]
    EntityNotFound { entity_id: EntityId },

    /// The voter does not exist in the system of record.
    #[error("Voter not found: {voter_id}")]
    VoterNotFound { voter_id: VoterId },

    /// Malformed input: bad intent string, non-positive id, score out of range.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The vote could not be committed. Nothing was recorded; the caller may
    /// try again.
    #[error("Vote by {voter_id} on {entity_id} not recorded, try again")]
    PersistenceFailure {
        voter_id: VoterId,
        entity_id: EntityId,
        #[source]
        source: anyhow::Error,
    },

    /// The counter store failed. Only surfaced by operations that have no
    /// fallback, such as draining the pending-sync set.
    #[error(transparent)]
    TransientStore(#[from] StoreError),

    /// An internal storage or database error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// True for the not-found variants.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EntityNotFound { .. } | Self::VoterNotFound { .. }
        )
    }
}

impl From<ParseEnumError> for CoreError {
    fn from(err: ParseEnumError) -> Self {
        Self::invalid(err.to_string())
    }
}
