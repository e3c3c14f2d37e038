//! Error types for Till Core.
//!
//! Every fallible operation returns [`LedgerError`]. Variants map onto a
//! small taxonomy (see [`ErrorKind`]) so callers can route errors without
//! matching individual variants: validation and state errors surface
//! immediately, concurrency conflicts are retryable, and collaborator
//! outages are queued or fatal depending on which collaborator failed.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Malformed or missing input (empty void reason, non-positive
    /// amount, unknown payment method).
    #[error("validation: {0}")]
    Validation(String),

    /// The operation is not valid for the entity's current state.
    #[error("{entity} {id} is {state}, cannot {operation}")]
    StateConflict {
        entity: &'static str,
        id: String,
        state: String,
        operation: &'static str,
    },

    /// No ownership match and no valid override grant, or the acting
    /// user's role does not meet the action's requirement.
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    /// Optimistic version check failed after bounded retries.
    #[error("concurrency conflict on {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: String },

    /// A required collaborator (inventory, gateway) is unreachable.
    #[error("collaborator unavailable: {0}")]
    ResourceUnavailable(String),

    /// A work period is already open.
    #[error("work period {0} is already open")]
    AlreadyOpen(String),

    /// The work period has already been closed.
    #[error("work period {0} is already closed")]
    AlreadyClosed(String),

    /// Close was blocked because unsettled receipts remain in the period.
    #[error("work period {period_id} has {count} unsettled receipts")]
    UnsettledReceipts { period_id: String, count: i64 },

    /// The close could not acquire exclusive access within its bounded
    /// wait. Safe to retry.
    #[error("work period {0} is busy, retry close")]
    PeriodBusy(String),

    /// Tendered payments do not cover the receipt's remaining balance.
    #[error("insufficient payment: tendered {tendered:.2}, remaining {remaining:.2}")]
    InsufficientPayment { tendered: f64, remaining: f64 },

    /// A split allocation omitted, duplicated, or misassigned items.
    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),

    /// A Z report was already generated for this period.
    #[error("z report already generated for period {0}")]
    AlreadyGenerated(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Coarse classification used by callers for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    StateConflict,
    AuthorizationDenied,
    ConcurrencyConflict,
    ResourceUnavailable,
    NotFound,
    Storage,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::StateConflict { .. }
            | LedgerError::AlreadyOpen(_)
            | LedgerError::AlreadyClosed(_)
            | LedgerError::UnsettledReceipts { .. }
            | LedgerError::InsufficientPayment { .. }
            | LedgerError::InvalidAllocation(_)
            | LedgerError::AlreadyGenerated(_) => ErrorKind::StateConflict,
            LedgerError::AuthorizationDenied(_) => ErrorKind::AuthorizationDenied,
            LedgerError::ConcurrencyConflict { .. } | LedgerError::PeriodBusy(_) => {
                ErrorKind::ConcurrencyConflict
            }
            LedgerError::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            LedgerError::NotFound { .. } => ErrorKind::NotFound,
            LedgerError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller may safely retry the same call.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyConflict
    }

    pub(crate) fn state_conflict(
        entity: &'static str,
        id: impl Into<String>,
        state: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        LedgerError::StateConflict {
            entity,
            id: id.into(),
            state: state.into(),
            operation,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.into(),
        }
    }
}
