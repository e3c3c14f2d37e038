//! The `Ledger` facade: the service boundary consumed by the UI layer.
//!
//! Wires the policy and the collaborator implementations into the ledger
//! modules and exposes one typed method per operation. Construction
//! starts with null collaborators; deployments attach real ones with the
//! `with_*` methods.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit;
use crate::db::{self, DbState};
use crate::error::LedgerResult;
use crate::guard::{self, Action, OverrideGrant, Role};
use crate::models::{
    Order, OrderItem, ItemInput, Payment, PaymentMethod, Receipt, SettlementOutcome, TenderInput,
    WorkPeriod,
};
use crate::outbox;
use crate::period;
use crate::policy::LedgerPolicy;
use crate::ports::{Inventory, NullInventory, NullPrinter, PaymentGateway, TicketPrinter};
use crate::receipts::{self, SplitAllocation};
use crate::reports::{self, XReport};
use crate::settlement;

pub struct Ledger {
    db: Arc<DbState>,
    policy: LedgerPolicy,
    inventory: Arc<dyn Inventory>,
    printer: Arc<dyn TicketPrinter>,
    gateway: Option<Arc<dyn PaymentGateway>>,
}

impl Ledger {
    /// A ledger over the given database with null collaborators.
    pub fn new(db: DbState, policy: LedgerPolicy) -> Self {
        Ledger {
            db: Arc::new(db),
            policy,
            inventory: Arc::new(NullInventory),
            printer: Arc::new(NullPrinter),
            gateway: None,
        }
    }

    pub fn with_inventory(mut self, inventory: Arc<dyn Inventory>) -> Self {
        self.inventory = inventory;
        self
    }

    pub fn with_printer(mut self, printer: Arc<dyn TicketPrinter>) -> Self {
        self.printer = printer;
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    fn gateway_ref(&self) -> Option<&dyn PaymentGateway> {
        self.gateway.as_deref()
    }

    // -- staff ---------------------------------------------------------------

    pub fn register_staff(
        &self,
        staff_id: &str,
        display_name: &str,
        role: Role,
        pin: Option<&str>,
    ) -> LedgerResult<()> {
        guard::register_staff(&self.db, staff_id, display_name, role, pin)
    }

    pub fn request_override(
        &self,
        receipt_id: &str,
        requesting_user: &str,
        authorizer_id: &str,
        authorizer_pin: &str,
        action: Action,
    ) -> LedgerResult<OverrideGrant> {
        guard::request_override(
            &self.db,
            receipt_id,
            requesting_user,
            authorizer_id,
            authorizer_pin,
            action,
        )
    }

    // -- work periods --------------------------------------------------------

    pub fn open_work_period(&self, opening_float: f64, user_id: &str) -> LedgerResult<WorkPeriod> {
        period::open_period(&self.db, opening_float, user_id)
    }

    pub fn close_work_period(
        &self,
        closing_cash_count: f64,
        user_id: &str,
    ) -> LedgerResult<WorkPeriod> {
        period::close_period(&self.db, &self.policy, closing_cash_count, user_id)
    }

    pub fn is_period_open(&self) -> LedgerResult<bool> {
        period::is_open(&self.db)
    }

    pub fn active_period(&self) -> LedgerResult<Option<WorkPeriod>> {
        period::active_period(&self.db)
    }

    pub fn get_period(&self, period_id: &str) -> LedgerResult<WorkPeriod> {
        period::get_period(&self.db, period_id)
    }

    // -- orders and receipts -------------------------------------------------

    pub fn create_order(&self, owner_id: &str, items: &[ItemInput]) -> LedgerResult<Order> {
        receipts::create_order(&self.db, owner_id, items)
    }

    pub fn create_receipt(&self, order_id: &str, owner_id: &str) -> LedgerResult<Receipt> {
        receipts::create_receipt(&self.db, &self.policy, order_id, owner_id)
    }

    pub fn add_items(
        &self,
        receipt_id: &str,
        items: &[ItemInput],
        acting_user: &str,
        grant_token: Option<&str>,
    ) -> LedgerResult<Vec<OrderItem>> {
        receipts::add_items(
            &self.db,
            &self.policy,
            receipt_id,
            items,
            acting_user,
            grant_token,
        )
    }

    pub fn void_item(
        &self,
        receipt_id: &str,
        item_id: &str,
        acting_user: &str,
        grant_token: Option<&str>,
    ) -> LedgerResult<Receipt> {
        receipts::void_item(
            &self.db,
            &self.policy,
            receipt_id,
            item_id,
            acting_user,
            grant_token,
        )
    }

    pub fn void_receipt(
        &self,
        receipt_id: &str,
        reason: &str,
        requesting_user: &str,
        authorizing_user: &str,
    ) -> LedgerResult<Receipt> {
        receipts::void_receipt(
            &self.db,
            &self.policy,
            self.inventory.as_ref(),
            receipt_id,
            reason,
            requesting_user,
            authorizing_user,
        )
    }

    pub fn split_receipt(
        &self,
        receipt_id: &str,
        allocation: &SplitAllocation,
        acting_user: &str,
        grant_token: Option<&str>,
    ) -> LedgerResult<Vec<Receipt>> {
        receipts::split_receipt(
            &self.db,
            &self.policy,
            receipt_id,
            allocation,
            acting_user,
            grant_token,
        )
    }

    pub fn merge_receipts(
        &self,
        receipt_ids: &[String],
        acting_user: &str,
    ) -> LedgerResult<Receipt> {
        receipts::merge_receipts(&self.db, &self.policy, receipt_ids, acting_user)
    }

    pub fn get_receipt(&self, receipt_id: &str) -> LedgerResult<Receipt> {
        receipts::get_receipt(&self.db, receipt_id)
    }

    pub fn get_items(&self, receipt_id: &str) -> LedgerResult<Vec<OrderItem>> {
        receipts::get_items(&self.db, receipt_id)
    }

    // -- settlement ----------------------------------------------------------

    pub fn settle(
        &self,
        receipt_id: &str,
        tenders: &[TenderInput],
    ) -> LedgerResult<SettlementOutcome> {
        settlement::settle(
            &self.db,
            &self.policy,
            self.inventory.as_ref(),
            self.gateway_ref(),
            receipt_id,
            tenders,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn apply_payment(
        &self,
        receipt_id: &str,
        method: PaymentMethod,
        amount: f64,
        reference: Option<&str>,
        idempotency_key: &str,
    ) -> LedgerResult<SettlementOutcome> {
        settlement::apply_payment(
            &self.db,
            &self.policy,
            self.inventory.as_ref(),
            self.gateway_ref(),
            receipt_id,
            method,
            amount,
            reference,
            idempotency_key,
        )
    }

    pub fn confirm_payment(&self, payment_id: &str) -> LedgerResult<SettlementOutcome> {
        settlement::confirm_payment(&self.db, &self.policy, self.inventory.as_ref(), payment_id)
    }

    pub fn fail_payment(&self, payment_id: &str, reason: &str) -> LedgerResult<()> {
        settlement::fail_payment(&self.db, payment_id, reason)
    }

    pub fn cancel_payment(&self, payment_id: &str, acting_user: &str) -> LedgerResult<()> {
        settlement::cancel_payment(&self.db, payment_id, acting_user)
    }

    pub fn payments_for_receipt(&self, receipt_id: &str) -> LedgerResult<Vec<Payment>> {
        settlement::payments_for_receipt(&self.db, receipt_id)
    }

    // -- reports and audit ---------------------------------------------------

    pub fn x_report(&self, period_id: &str) -> LedgerResult<XReport> {
        reports::x_report(&self.db, period_id)
    }

    pub fn get_z_report(&self, period_id: &str) -> LedgerResult<Value> {
        reports::get_z_report(&self.db, period_id)
    }

    pub fn audit_trail(&self, entity_type: &str, entity_id: &str) -> LedgerResult<Vec<Value>> {
        let conn = db::lock_conn(&self.db);
        audit::entries_for(&conn, entity_type, entity_id)
    }

    // -- side effects --------------------------------------------------------

    /// Start the background dispatch worker for printing side effects.
    pub fn spawn_side_effect_worker(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        outbox::spawn_worker(self.db.clone(), self.printer.clone(), interval, cancel)
    }

    /// Drain pending side effects once, synchronously.
    pub fn drain_side_effects(&self) -> LedgerResult<usize> {
        outbox::drain_once(&self.db, self.printer.as_ref())
    }

    pub fn pending_side_effects(&self) -> LedgerResult<i64> {
        outbox::pending_count(&self.db)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, LedgerError};
    use crate::models::{ReceiptState, MONEY_EPSILON};
    use crate::policy::{SettlementMode, UnsettledClosePolicy};
    use crate::ports::test_doubles::{FlakyPrinter, RecordingInventory};
    use std::sync::atomic::Ordering;

    fn item(product: &str, qty: f64, price: f64) -> ItemInput {
        ItemInput {
            product_ref: product.to_string(),
            category: "food".to_string(),
            description: product.to_string(),
            quantity: qty,
            unit_price: price,
            discount: 0.0,
            tax: 0.0,
        }
    }

    fn ledger_with(policy: LedgerPolicy) -> (Ledger, Arc<RecordingInventory>, Arc<FlakyPrinter>) {
        let inventory = Arc::new(RecordingInventory::default());
        let printer = Arc::new(FlakyPrinter::default());
        let ledger = Ledger::new(db::init_in_memory().unwrap(), policy)
            .with_inventory(inventory.clone())
            .with_printer(printer.clone());
        ledger
            .register_staff("owner-1", "Amina", Role::Cashier, None)
            .unwrap();
        ledger
            .register_staff("sup-1", "Otieno", Role::Supervisor, Some("2468"))
            .unwrap();
        ledger
            .register_staff("mgr-1", "Wanjiru", Role::Manager, Some("1357"))
            .unwrap();
        (ledger, inventory, printer)
    }

    #[test]
    fn full_day_cycle() {
        let policy = LedgerPolicy {
            settlement_mode: SettlementMode::AutoSettleOnPrint,
            unsettled_at_close: UnsettledClosePolicy::Block,
            ..LedgerPolicy::default()
        };
        let (ledger, inventory, printer) = ledger_with(policy);

        // Morning: manager opens the period with a 100.00 float
        let period = ledger.open_work_period(100.0, "mgr-1").unwrap();
        assert!(ledger.is_period_open().unwrap());

        // A table orders, then adds a second round
        let order = ledger
            .create_order("owner-1", &[item("fish", 1.0, 12.0), item("rice", 1.0, 4.0)])
            .unwrap();
        let receipt = ledger.create_receipt(&order.id, "owner-1").unwrap();
        assert_eq!(receipt.state, ReceiptState::Pending);

        let round2 = ledger
            .add_items(&receipt.id, &[item("soda", 2.0, 1.5)], "owner-1", None)
            .unwrap();
        assert_eq!(round2.len(), 1);
        assert_eq!(round2[0].batch_number, 2);

        // Settle 19.00 with 20.00 cash
        let outcome = ledger
            .settle(
                &receipt.id,
                &[TenderInput {
                    method: PaymentMethod::Cash,
                    amount: 20.0,
                    reference: None,
                }],
            )
            .unwrap();
        assert_eq!(outcome.state, ReceiptState::Settled);
        assert!((outcome.change - 1.0).abs() < MONEY_EPSILON);
        assert_eq!(inventory.deductions.lock().unwrap().len(), 3);

        // Side effects: two kitchen tickets (opening batch + round 2) and
        // one customer receipt
        assert_eq!(ledger.pending_side_effects().unwrap(), 3);
        assert_eq!(ledger.drain_side_effects().unwrap(), 3);
        assert_eq!(printer.tickets.load(Ordering::SeqCst), 2);
        assert_eq!(printer.receipts.load(Ordering::SeqCst), 1);

        // Mid-day X report
        let x = ledger.x_report(&period.id).unwrap();
        assert_eq!(x.settled_count, 1);
        assert!((x.settled_total - 19.0).abs() < MONEY_EPSILON);

        // Evening: close with the counted drawer (100 + 19 = 119)
        let closed = ledger.close_work_period(119.0, "mgr-1").unwrap();
        assert!((closed.variance.unwrap() - 0.0).abs() < MONEY_EPSILON);
        assert_eq!(closed.z_report_number, Some(1));

        let z = ledger.get_z_report(&period.id).unwrap();
        assert_eq!(z["reportNumber"], 1);
        assert_eq!(z["aggregates"]["settled_count"], 1);

        // The audit trail recorded the full story
        let trail = ledger.audit_trail("receipt", &receipt.id).unwrap();
        let actions: Vec<&str> = trail
            .iter()
            .filter_map(|e| e["action"].as_str())
            .collect();
        assert!(actions.contains(&"receipt.create"));
        assert!(actions.contains(&"receipt.add_items"));
        assert!(actions.contains(&"receipt.settle"));
    }

    #[test]
    fn merge_then_settle_archived_source_fails() {
        let policy = LedgerPolicy {
            settlement_mode: SettlementMode::AutoSettleOnPrint,
            ..LedgerPolicy::default()
        };
        let (ledger, _inventory, _printer) = ledger_with(policy);
        ledger.open_work_period(100.0, "mgr-1").unwrap();

        let a = {
            let order = ledger
                .create_order("owner-1", &[item("burger", 1.0, 10.0)])
                .unwrap();
            ledger.create_receipt(&order.id, "owner-1").unwrap()
        };
        let b = {
            let order = ledger
                .create_order("owner-1", &[item("pizza", 1.0, 15.0)])
                .unwrap();
            ledger.create_receipt(&order.id, "owner-1").unwrap()
        };

        let merged = ledger
            .merge_receipts(&[a.id.clone(), b.id.clone()], "owner-1")
            .unwrap();
        assert!((merged.total - 25.0).abs() < MONEY_EPSILON);

        let err = ledger
            .settle(
                &a.id,
                &[TenderInput {
                    method: PaymentMethod::Cash,
                    amount: 10.0,
                    reference: None,
                }],
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn void_window_policy_gates_settled_voids() {
        let strict = LedgerPolicy {
            settlement_mode: SettlementMode::AutoSettleOnPrint,
            void_window: crate::policy::VoidWindow::BeforeSettlementOnly,
            ..LedgerPolicy::default()
        };
        let (ledger, _inventory, _printer) = ledger_with(strict);
        ledger.open_work_period(100.0, "mgr-1").unwrap();

        let order = ledger
            .create_order("owner-1", &[item("burger", 1.0, 10.0)])
            .unwrap();
        let receipt = ledger.create_receipt(&order.id, "owner-1").unwrap();
        ledger
            .settle(
                &receipt.id,
                &[TenderInput {
                    method: PaymentMethod::Cash,
                    amount: 10.0,
                    reference: None,
                }],
            )
            .unwrap();

        let err = ledger
            .void_receipt(&receipt.id, "changed mind", "owner-1", "sup-1")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn settled_void_reverses_stock_under_default_policy() {
        let policy = LedgerPolicy {
            settlement_mode: SettlementMode::AutoSettleOnPrint,
            ..LedgerPolicy::default()
        };
        let (ledger, inventory, _printer) = ledger_with(policy);
        ledger.open_work_period(100.0, "mgr-1").unwrap();

        let order = ledger
            .create_order("owner-1", &[item("burger", 2.0, 10.0)])
            .unwrap();
        let receipt = ledger.create_receipt(&order.id, "owner-1").unwrap();
        ledger
            .settle(
                &receipt.id,
                &[TenderInput {
                    method: PaymentMethod::Cash,
                    amount: 20.0,
                    reference: None,
                }],
            )
            .unwrap();

        let voided = ledger
            .void_receipt(&receipt.id, "kitchen error", "owner-1", "sup-1")
            .unwrap();
        assert_eq!(voided.state, ReceiptState::Voided);

        let reversals = inventory.reversals.lock().unwrap();
        assert_eq!(reversals.len(), 1);
        assert_eq!(reversals[0].0, "burger");
        assert!((reversals[0].1 - 2.0).abs() < f64::EPSILON);

        // Payments were reversed with the void
        let payments = ledger.payments_for_receipt(&receipt.id).unwrap();
        assert!(payments
            .iter()
            .all(|p| p.status == crate::models::PaymentStatus::Reversed));
    }

    #[test]
    fn equal_split_through_the_facade() {
        let policy = LedgerPolicy {
            settlement_mode: SettlementMode::AutoSettleOnPrint,
            ..LedgerPolicy::default()
        };
        let (ledger, _inventory, _printer) = ledger_with(policy);
        ledger.open_work_period(100.0, "mgr-1").unwrap();

        let order = ledger
            .create_order("owner-1", &[item("platter", 1.0, 30.0)])
            .unwrap();
        let receipt = ledger.create_receipt(&order.id, "owner-1").unwrap();

        let children = ledger
            .split_receipt(&receipt.id, &SplitAllocation::Equal(3), "owner-1", None)
            .unwrap();
        let sum: f64 = children.iter().map(|c| c.total).sum();
        assert!((sum - 30.0).abs() < f64::EPSILON);

        // Each share settles independently
        for child in &children {
            let outcome = ledger
                .settle(
                    &child.id,
                    &[TenderInput {
                        method: PaymentMethod::Cash,
                        amount: child.total,
                        reference: None,
                    }],
                )
                .unwrap();
            assert_eq!(outcome.state, ReceiptState::Settled);
        }
    }

    #[tokio::test]
    async fn background_worker_prints_after_settle() {
        let policy = LedgerPolicy {
            settlement_mode: SettlementMode::AutoSettleOnPrint,
            ..LedgerPolicy::default()
        };
        let (ledger, _inventory, printer) = ledger_with(policy);
        ledger.open_work_period(100.0, "mgr-1").unwrap();

        let cancel = CancellationToken::new();
        let handle = ledger.spawn_side_effect_worker(Duration::from_millis(10), cancel.clone());

        let order = ledger
            .create_order("owner-1", &[item("burger", 1.0, 10.0)])
            .unwrap();
        let receipt = ledger.create_receipt(&order.id, "owner-1").unwrap();
        ledger
            .settle(
                &receipt.id,
                &[TenderInput {
                    method: PaymentMethod::Cash,
                    amount: 10.0,
                    reference: None,
                }],
            )
            .unwrap();

        for _ in 0..100 {
            if printer.receipts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(printer.receipts.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn no_open_period_blocks_order_creation() {
        let (ledger, _inventory, _printer) = ledger_with(LedgerPolicy::default());
        let err = ledger
            .create_order("owner-1", &[item("tea", 1.0, 2.0)])
            .unwrap_err();
        assert!(matches!(err, LedgerError::StateConflict { .. }));
    }
}
