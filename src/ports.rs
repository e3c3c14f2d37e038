//! Collaborator interfaces.
//!
//! The ledger talks to the outside world through these traits: inventory
//! (synchronous, inside the commit boundary), printing and notifications
//! (asynchronous, via the outbox), and the payment gateway (async capture
//! confirmation). Null implementations are the defaults for deployments
//! that wire a collaborator up later.

use crate::models::PaymentMethod;

/// Error surfaced by a collaborator. The ledger maps it onto
/// `LedgerError::ResourceUnavailable` with the policy of §7 applied.
#[derive(Debug, Clone)]
pub struct CollabError(pub String);

impl std::fmt::Display for CollabError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for CollabError {}

/// Stock movements. Invoked by the ledger on settle (deduct) and void
/// (reverse), synchronously within the same transaction: a failure here
/// rolls the ledger transition back.
pub trait Inventory: Send + Sync {
    fn deduct_stock(&self, product_ref: &str, qty: f64, receipt_id: &str)
        -> Result<(), CollabError>;
    fn reverse_stock(
        &self,
        product_ref: &str,
        qty: f64,
        receipt_id: &str,
    ) -> Result<(), CollabError>;
}

/// Ticket and receipt printing. Invoked post-commit by the outbox worker;
/// failures are retried in the background and never reach the ledger.
pub trait TicketPrinter: Send + Sync {
    fn print_ticket(&self, receipt_id: &str, payload: &str) -> Result<(), CollabError>;
    fn print_receipt(&self, receipt_id: &str, payload: &str) -> Result<(), CollabError>;
}

/// External payment capture. `initiate_payment` returns a gateway
/// reference; confirmation and failure arrive later through
/// `Ledger::confirm_payment` / `Ledger::fail_payment`.
pub trait PaymentGateway: Send + Sync {
    fn initiate_payment(
        &self,
        method: PaymentMethod,
        amount: f64,
        reference: Option<&str>,
    ) -> Result<String, CollabError>;
}

// ---------------------------------------------------------------------------
// Null defaults
// ---------------------------------------------------------------------------

/// Inventory that accepts every movement. For deployments without stock
/// tracking.
#[derive(Debug, Default)]
pub struct NullInventory;

impl Inventory for NullInventory {
    fn deduct_stock(&self, _: &str, _: f64, _: &str) -> Result<(), CollabError> {
        Ok(())
    }
    fn reverse_stock(&self, _: &str, _: f64, _: &str) -> Result<(), CollabError> {
        Ok(())
    }
}

/// Printer that drops every job.
#[derive(Debug, Default)]
pub struct NullPrinter;

impl TicketPrinter for NullPrinter {
    fn print_ticket(&self, _: &str, _: &str) -> Result<(), CollabError> {
        Ok(())
    }
    fn print_receipt(&self, _: &str, _: &str) -> Result<(), CollabError> {
        Ok(())
    }
}
