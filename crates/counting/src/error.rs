//! Counting-specific error kinds.

use thiserror::Error;

use stocktake_core::DomainError;

use crate::ids::CountableItemId;
use crate::status::SessionStatus;

/// Minimum length (in characters, after trimming) of manual override notes.
pub const MIN_OVERRIDE_NOTES_LEN: usize = 10;

/// Rejection reasons for counting commands and counter/supervisor reads.
///
/// Every rejection happens before any event is emitted, so a failed command
/// never leaves a partial write behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CountingError {
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("a counter assigned to several counts requires sequential execution mode")]
    SequentialModeRequired,

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error("counter has no active assignment for this session")]
    Unauthorized,

    #[error("item {0} is not in scope")]
    ItemNotInScope(CountableItemId),

    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),

    #[error("session is cancelled")]
    SessionCancelled,

    #[error("session is finalized")]
    SessionFinalized,

    #[error("{} item(s) still unresolved", .0.len())]
    UnresolvedItems(Vec<CountableItemId>),

    #[error("manual override requires notes of at least {} characters", MIN_OVERRIDE_NOTES_LEN)]
    ManualOverrideRequiresNotes,

    #[error("count entry for item {0} is locked by its resolution")]
    EntryLocked(CountableItemId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl CountingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_scope(msg: impl Into<String>) -> Self {
        Self::InvalidScope(msg.into())
    }

    /// Stable machine-readable code (API payloads, logs).
    pub fn code(&self) -> &'static str {
        match self {
            CountingError::InvalidScope(_) => "invalid_scope",
            CountingError::SequentialModeRequired => "sequential_mode_required",
            CountingError::InvalidStateTransition { .. } => "invalid_state_transition",
            CountingError::Unauthorized => "unauthorized",
            CountingError::ItemNotInScope(_) => "item_not_in_scope",
            CountingError::InvalidQuantity(_) => "invalid_quantity",
            CountingError::SessionCancelled => "session_cancelled",
            CountingError::SessionFinalized => "session_finalized",
            CountingError::UnresolvedItems(_) => "unresolved_items",
            CountingError::ManualOverrideRequiresNotes => "manual_override_requires_notes",
            CountingError::EntryLocked(_) => "entry_locked",
            CountingError::Validation(_) => "validation_error",
            CountingError::NotFound => "not_found",
            CountingError::Domain(_) => "domain_error",
        }
    }
}
