//! Till Core - the shift-scoped receipt and order ledger behind a POS
//! terminal.
//!
//! The crate owns the work-period lifecycle (open/close with cash
//! reconciliation and sequenced Z reports), the receipt state machine
//! (create, add item batches, split, merge, void), payment settlement
//! with idempotent split tender, and an append-only audit log. Storage
//! is a single WAL-mode SQLite database per register group; every
//! transition commits atomically with its audit entry and any inventory
//! movement, while printing is dispatched post-commit through a
//! background-retried outbox.
//!
//! The embedding application talks to [`Ledger`]; everything external
//! (stock, printers, payment capture) enters through the traits in
//! [`ports`].

mod audit;
pub mod db;
mod error;
mod guard;
mod models;
mod outbox;
mod period;
mod policy;
pub mod ports;
mod receipts;
mod reports;
mod service;
mod settlement;
#[cfg(test)]
mod testutil;

pub use error::{ErrorKind, LedgerError, LedgerResult};
pub use guard::{Action, OverrideGrant, Role};
pub use models::{
    AuditEntry, ItemInput, Order, OrderItem, Payment, PaymentMethod, PaymentStatus, PeriodStatus,
    Receipt, ReceiptState, SettlementOutcome, TenderInput, WorkPeriod, MONEY_EPSILON,
};
pub use policy::{LedgerPolicy, SettlementMode, UnsettledClosePolicy, VoidWindow};
pub use receipts::SplitAllocation;
pub use reports::{CategoryLine, MethodLine, UserLine, XReport};
pub use service::Ledger;
