//! Deployment policies for Till Core.
//!
//! All behavior toggles are injected at [`crate::service::Ledger`]
//! construction as one value instead of scattered conditionals. Defaults
//! match the most common restaurant deployment of the source product.

use serde::{Deserialize, Serialize};

/// Whether a newly created receipt starts settled-trackable immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementMode {
    /// Receipts start in `pending` and are expected to settle at print
    /// time (counter service).
    AutoSettleOnPrint,
    /// Receipts start in `created` and move to `pending` on first item
    /// batch (table service, settle later).
    Manual,
}

/// When a receipt may still be voided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidWindow {
    /// Settled receipts may be voided until their work period closes.
    /// Default: the reconciliation report carries voided-after-settle
    /// lines, so the period close is the natural cut-off.
    UntilPeriodClose,
    /// Strict mode: only created/pending receipts may be voided.
    BeforeSettlementOnly,
}

/// What `close_period` does when unsettled receipts remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsettledClosePolicy {
    /// Refuse to close with `UnsettledReceipts`.
    Block,
    /// Close anyway; unsettled receipts are logged and excluded from the
    /// settled totals of the Z snapshot.
    WarnAndClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPolicy {
    pub settlement_mode: SettlementMode,
    pub void_window: VoidWindow,
    pub unsettled_at_close: UnsettledClosePolicy,
    /// Permit settles to commit when the inventory collaborator is
    /// unreachable. Off by default: stock consistency wins.
    pub allow_oversell: bool,
    /// Bounded internal retries on optimistic version conflicts.
    pub conflict_retries: u32,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        LedgerPolicy {
            settlement_mode: SettlementMode::Manual,
            void_window: VoidWindow::UntilPeriodClose,
            unsettled_at_close: UnsettledClosePolicy::Block,
            allow_oversell: false,
            conflict_retries: 3,
        }
    }
}
