//! Payment application for Till Core.
//!
//! Payments accrue against a receipt's balance until it is covered, at
//! which point the receipt settles: change is computed for cash tenders,
//! stock is deducted through the inventory collaborator inside the same
//! transaction, and the customer receipt print is enqueued. Replays of an
//! idempotency key return the prior outcome without touching state.
//!
//! Non-cash tenders route through the payment gateway when one is
//! configured: the payment sits in `authorizing` until the gateway
//! confirms or fails it, and may be cancelled until then. Deployments
//! without a gateway capture offline and complete immediately.

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::db::{self, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AuditEntry, Payment, PaymentMethod, PaymentStatus, Receipt, ReceiptState, SettlementOutcome,
    TenderInput, MONEY_EPSILON,
};
use crate::outbox;
use crate::policy::LedgerPolicy;
use crate::ports::{Inventory, PaymentGateway};
use crate::receipts::{
    active_items, ensure_period_open, fetch_receipt, with_conflict_retries,
};

// ---------------------------------------------------------------------------
// Apply a single payment
// ---------------------------------------------------------------------------

/// Apply one tender to a receipt. Supports split tender across repeated
/// calls; the call that covers the balance settles the receipt.
#[allow(clippy::too_many_arguments)]
pub fn apply_payment(
    db: &DbState,
    policy: &LedgerPolicy,
    inventory: &dyn Inventory,
    gateway: Option<&dyn PaymentGateway>,
    receipt_id: &str,
    method: PaymentMethod,
    amount: f64,
    reference: Option<&str>,
    idempotency_key: &str,
) -> LedgerResult<SettlementOutcome> {
    if amount <= 0.0 {
        return Err(LedgerError::Validation("amount must be positive".into()));
    }
    if idempotency_key.trim().is_empty() {
        return Err(LedgerError::Validation("idempotency key is required".into()));
    }

    with_conflict_retries(policy.conflict_retries, || {
        let conn = db::lock_conn(db);

        // Replay: same key returns the prior result untouched.
        if let Some(prior) = find_by_idempotency_key(&conn, idempotency_key)? {
            let receipt = fetch_receipt(&conn, &prior.receipt_id)?;
            info!(
                payment_id = %prior.id,
                receipt_id = %prior.receipt_id,
                "Idempotency key replay, returning prior result"
            );
            return Ok(SettlementOutcome {
                receipt_id: prior.receipt_id.clone(),
                payment_ids: vec![prior.id],
                state: receipt.state,
                paid_amount: receipt.paid_amount,
                change: prior.change_given,
                replayed: true,
            });
        }

        let receipt = fetch_receipt(&conn, receipt_id)?;
        ensure_period_open(&conn, &receipt.work_period_id, "apply_payment")?;
        if !receipt.state.is_mutable() {
            return Err(LedgerError::state_conflict(
                "receipt",
                receipt_id,
                receipt.state.as_str(),
                "apply_payment",
            ));
        }

        let remaining = receipt.total - receipt.paid_amount;
        if !method.gives_change() && amount > remaining + MONEY_EPSILON {
            return Err(LedgerError::Validation(format!(
                "{} payment of {amount:.2} exceeds remaining balance {remaining:.2}",
                method.as_str()
            )));
        }

        // Gateway capture: record the authorizing payment and wait for
        // the async confirmation.
        if method != PaymentMethod::Cash {
            if let Some(gateway) = gateway {
                let gw_ref = gateway
                    .initiate_payment(method, amount, reference)
                    .map_err(|e| {
                        LedgerError::ResourceUnavailable(format!("payment gateway: {e}"))
                    })?;
                return insert_authorizing(
                    &conn,
                    &receipt,
                    method,
                    amount,
                    &gw_ref,
                    idempotency_key,
                );
            }
        }

        apply_completed(
            &conn,
            policy,
            inventory,
            &receipt,
            method,
            amount,
            reference,
            idempotency_key,
        )
    })
}

/// Batch form of the service boundary. Validates the whole tender set
/// against the remaining balance first: an insufficient batch fails with
/// `InsufficientPayment` before any state changes.
#[allow(clippy::too_many_arguments)]
pub fn settle(
    db: &DbState,
    policy: &LedgerPolicy,
    inventory: &dyn Inventory,
    gateway: Option<&dyn PaymentGateway>,
    receipt_id: &str,
    tenders: &[TenderInput],
) -> LedgerResult<SettlementOutcome> {
    if tenders.is_empty() {
        return Err(LedgerError::Validation("at least one tender required".into()));
    }

    {
        let conn = db::lock_conn(db);
        let receipt = fetch_receipt(&conn, receipt_id)?;
        if !receipt.state.is_mutable() {
            return Err(LedgerError::state_conflict(
                "receipt",
                receipt_id,
                receipt.state.as_str(),
                "settle",
            ));
        }
        let remaining = receipt.total - receipt.paid_amount;
        let tendered: f64 = tenders.iter().map(|t| t.amount).sum();
        if tendered + MONEY_EPSILON < remaining {
            return Err(LedgerError::InsufficientPayment {
                tendered,
                remaining,
            });
        }
    }

    let mut outcome: Option<SettlementOutcome> = None;
    for tender in tenders {
        let result = apply_payment(
            db,
            policy,
            inventory,
            gateway,
            receipt_id,
            tender.method,
            tender.amount,
            tender.reference.as_deref(),
            &format!("settle:{receipt_id}:{}", Uuid::new_v4()),
        )?;
        outcome = Some(match outcome.take() {
            None => result,
            Some(mut prior) => {
                prior.payment_ids.extend(result.payment_ids);
                prior.state = result.state;
                prior.paid_amount = result.paid_amount;
                prior.change = result.change;
                prior
            }
        });
    }

    // tenders is non-empty, so outcome is always set by the loop
    outcome.ok_or_else(|| LedgerError::Validation("at least one tender required".into()))
}

// ---------------------------------------------------------------------------
// Gateway callbacks
// ---------------------------------------------------------------------------

/// Gateway confirmed the capture: complete the payment, settling the
/// receipt if the balance is now covered.
pub fn confirm_payment(
    db: &DbState,
    policy: &LedgerPolicy,
    inventory: &dyn Inventory,
    payment_id: &str,
) -> LedgerResult<SettlementOutcome> {
    with_conflict_retries(policy.conflict_retries, || {
        let conn = db::lock_conn(db);
        let payment = fetch_payment(&conn, payment_id)?;
        if payment.status != PaymentStatus::Authorizing {
            return Err(LedgerError::state_conflict(
                "payment",
                payment_id,
                payment.status.as_str(),
                "confirm_payment",
            ));
        }
        let receipt = fetch_receipt(&conn, &payment.receipt_id)?;
        ensure_period_open(&conn, &receipt.work_period_id, "confirm_payment")?;
        // A void that landed while the capture was in flight wins; the
        // confirmation cannot resurrect the receipt.
        if !receipt.state.is_mutable() {
            return Err(LedgerError::state_conflict(
                "receipt",
                &receipt.id,
                receipt.state.as_str(),
                "confirm_payment",
            ));
        }

        complete_existing(&conn, policy, inventory, &receipt, &payment)
    })
}

/// Gateway reported the capture failed. The receipt is unchanged.
pub fn fail_payment(db: &DbState, payment_id: &str, reason: &str) -> LedgerResult<()> {
    let conn = db::lock_conn(db);
    let payment = fetch_payment(&conn, payment_id)?;
    if payment.status != PaymentStatus::Authorizing {
        return Err(LedgerError::state_conflict(
            "payment",
            payment_id,
            payment.status.as_str(),
            "fail_payment",
        ));
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> LedgerResult<()> {
        conn.execute(
            "UPDATE payments SET status = 'failed', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), payment_id],
        )?;
        audit::append(
            &conn,
            &AuditEntry {
                actor: "gateway".into(),
                authorized_by: None,
                action: "payment.fail".into(),
                entity_type: "payment".into(),
                entity_id: payment_id.to_string(),
                before: serde_json::json!({ "status": "authorizing" }),
                after: serde_json::json!({ "status": "failed", "reason": reason }),
            },
        )?;
        Ok(())
    })();
    commit_or_rollback(&conn, result)?;

    warn!(payment_id = %payment_id, reason = %reason, "Payment capture failed");
    Ok(())
}

/// Cancel a capture that has not confirmed yet. After confirmation only
/// void is available.
pub fn cancel_payment(db: &DbState, payment_id: &str, acting_user: &str) -> LedgerResult<()> {
    let conn = db::lock_conn(db);
    let payment = fetch_payment(&conn, payment_id)?;
    if payment.status != PaymentStatus::Authorizing {
        return Err(LedgerError::state_conflict(
            "payment",
            payment_id,
            payment.status.as_str(),
            "cancel_payment",
        ));
    }

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> LedgerResult<()> {
        conn.execute(
            "UPDATE payments SET status = 'cancelled', updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), payment_id],
        )?;
        audit::append(
            &conn,
            &AuditEntry {
                actor: acting_user.to_string(),
                authorized_by: None,
                action: "payment.cancel".into(),
                entity_type: "payment".into(),
                entity_id: payment_id.to_string(),
                before: serde_json::json!({ "status": "authorizing" }),
                after: serde_json::json!({ "status": "cancelled" }),
            },
        )?;
        Ok(())
    })();
    commit_or_rollback(&conn, result)?;

    info!(payment_id = %payment_id, "Payment capture cancelled before confirmation");
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn payments_for_receipt(db: &DbState, receipt_id: &str) -> LedgerResult<Vec<Payment>> {
    let conn = db::lock_conn(db);
    let mut stmt = conn.prepare(
        "SELECT * FROM payments WHERE receipt_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![receipt_id], Payment::from_row)?;
    let mut payments = Vec::new();
    for row in rows {
        match row {
            Ok(p) => payments.push(p),
            Err(e) => warn!("skipping malformed payment row: {e}"),
        }
    }
    Ok(payments)
}

// ---------------------------------------------------------------------------
// Internal
// ---------------------------------------------------------------------------

fn find_by_idempotency_key(
    conn: &Connection,
    key: &str,
) -> LedgerResult<Option<Payment>> {
    match conn.query_row(
        "SELECT * FROM payments WHERE idempotency_key = ?1",
        params![key],
        Payment::from_row,
    ) {
        Ok(payment) => Ok(Some(payment)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(LedgerError::Storage(e)),
    }
}

fn fetch_payment(conn: &Connection, payment_id: &str) -> LedgerResult<Payment> {
    conn.query_row(
        "SELECT * FROM payments WHERE id = ?1",
        params![payment_id],
        Payment::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => LedgerError::not_found("payment", payment_id),
        other => LedgerError::Storage(other),
    })
}

fn insert_authorizing(
    conn: &Connection,
    receipt: &Receipt,
    method: PaymentMethod,
    amount: f64,
    gateway_ref: &str,
    idempotency_key: &str,
) -> LedgerResult<SettlementOutcome> {
    let payment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> LedgerResult<()> {
        conn.execute(
            "INSERT INTO payments (
                id, receipt_id, method, amount, reference, idempotency_key,
                status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'authorizing', ?7, ?7)",
            params![
                payment_id,
                receipt.id,
                method.as_str(),
                amount,
                gateway_ref,
                idempotency_key,
                now,
            ],
        )?;
        audit::append(
            conn,
            &AuditEntry {
                actor: receipt.owner_id.clone(),
                authorized_by: None,
                action: "payment.initiate".into(),
                entity_type: "payment".into(),
                entity_id: payment_id.clone(),
                before: serde_json::Value::Null,
                after: serde_json::json!({
                    "receiptId": receipt.id,
                    "method": method.as_str(),
                    "amount": amount,
                    "gatewayRef": gateway_ref,
                }),
            },
        )?;
        Ok(())
    })();
    commit_or_rollback(conn, result)?;

    info!(
        payment_id = %payment_id,
        receipt_id = %receipt.id,
        method = %method.as_str(),
        amount = %amount,
        "Payment capture initiated, awaiting confirmation"
    );

    Ok(SettlementOutcome {
        receipt_id: receipt.id.clone(),
        payment_ids: vec![payment_id],
        state: receipt.state,
        paid_amount: receipt.paid_amount,
        change: 0.0,
        replayed: false,
    })
}

/// Insert a completed payment and run the settle check.
#[allow(clippy::too_many_arguments)]
fn apply_completed(
    conn: &Connection,
    policy: &LedgerPolicy,
    inventory: &dyn Inventory,
    receipt: &Receipt,
    method: PaymentMethod,
    amount: f64,
    reference: Option<&str>,
    idempotency_key: &str,
) -> LedgerResult<SettlementOutcome> {
    let payment_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    let new_paid = receipt.paid_amount + amount;
    let covered = new_paid + MONEY_EPSILON >= receipt.total;
    let change = if covered && method.gives_change() {
        (new_paid - receipt.total).max(0.0)
    } else {
        0.0
    };

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> LedgerResult<ReceiptState> {
        conn.execute(
            "INSERT INTO payments (
                id, receipt_id, method, amount, change_given, reference,
                idempotency_key, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'completed', ?8, ?8)",
            params![
                payment_id,
                receipt.id,
                method.as_str(),
                amount,
                change,
                reference,
                idempotency_key,
                now,
            ],
        )?;

        let new_state = if covered {
            settle_in_txn(conn, policy, inventory, receipt, new_paid, change, &now)?;
            ReceiptState::Settled
        } else {
            // Partial tender keeps the receipt on the floor.
            let state = if receipt.state == ReceiptState::Created {
                ReceiptState::Pending
            } else {
                receipt.state
            };
            let updated = conn.execute(
                "UPDATE receipts SET state = ?1, paid_amount = ?2,
                    version = version + 1, updated_at = ?3
                 WHERE id = ?4 AND version = ?5",
                params![state.as_str(), new_paid, now, receipt.id, receipt.version],
            )?;
            if updated == 0 {
                return Err(LedgerError::ConcurrencyConflict {
                    entity: "receipt",
                    id: receipt.id.clone(),
                });
            }
            audit::append(
                conn,
                &AuditEntry {
                    actor: receipt.owner_id.clone(),
                    authorized_by: None,
                    action: "payment.apply".into(),
                    entity_type: "receipt".into(),
                    entity_id: receipt.id.clone(),
                    before: serde_json::json!({ "paidAmount": receipt.paid_amount }),
                    after: serde_json::json!({
                        "paidAmount": new_paid,
                        "method": method.as_str(),
                        "amount": amount,
                    }),
                },
            )?;
            state
        };

        Ok(new_state)
    })();

    let state = commit_or_rollback(conn, result)?;

    info!(
        payment_id = %payment_id,
        receipt_id = %receipt.id,
        method = %method.as_str(),
        amount = %amount,
        settled = covered,
        "Payment recorded"
    );

    Ok(SettlementOutcome {
        receipt_id: receipt.id.clone(),
        payment_ids: vec![payment_id],
        state,
        paid_amount: new_paid,
        change,
        replayed: false,
    })
}

/// Complete a previously authorizing payment.
fn complete_existing(
    conn: &Connection,
    policy: &LedgerPolicy,
    inventory: &dyn Inventory,
    receipt: &Receipt,
    payment: &Payment,
) -> LedgerResult<SettlementOutcome> {
    let now = Utc::now().to_rfc3339();
    let new_paid = receipt.paid_amount + payment.amount;
    let covered = new_paid + MONEY_EPSILON >= receipt.total;

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> LedgerResult<ReceiptState> {
        conn.execute(
            "UPDATE payments SET status = 'completed', updated_at = ?1 WHERE id = ?2",
            params![now, payment.id],
        )?;

        if covered {
            settle_in_txn(conn, policy, inventory, receipt, new_paid, 0.0, &now)?;
            Ok(ReceiptState::Settled)
        } else {
            let updated = conn.execute(
                "UPDATE receipts SET paid_amount = ?1, version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND version = ?4",
                params![new_paid, now, receipt.id, receipt.version],
            )?;
            if updated == 0 {
                return Err(LedgerError::ConcurrencyConflict {
                    entity: "receipt",
                    id: receipt.id.clone(),
                });
            }
            audit::append(
                conn,
                &AuditEntry {
                    actor: "gateway".into(),
                    authorized_by: None,
                    action: "payment.confirm".into(),
                    entity_type: "receipt".into(),
                    entity_id: receipt.id.clone(),
                    before: serde_json::json!({ "paidAmount": receipt.paid_amount }),
                    after: serde_json::json!({ "paidAmount": new_paid }),
                },
            )?;
            Ok(receipt.state)
        }
    })();

    let state = commit_or_rollback(conn, result)?;

    info!(
        payment_id = %payment.id,
        receipt_id = %receipt.id,
        settled = covered,
        "Payment capture confirmed"
    );

    Ok(SettlementOutcome {
        receipt_id: receipt.id.clone(),
        payment_ids: vec![payment.id.clone()],
        state,
        paid_amount: new_paid,
        change: 0.0,
        replayed: false,
    })
}

/// The settle transition: mark the receipt settled, deduct stock inside
/// the transaction, enqueue the customer receipt print, audit.
fn settle_in_txn(
    conn: &Connection,
    policy: &LedgerPolicy,
    inventory: &dyn Inventory,
    receipt: &Receipt,
    paid_amount: f64,
    change: f64,
    now: &str,
) -> LedgerResult<()> {
    for item in active_items(conn, &receipt.order_id)? {
        if let Err(e) = inventory.deduct_stock(&item.product_ref, item.quantity, &receipt.id) {
            if policy.allow_oversell {
                warn!(
                    receipt_id = %receipt.id,
                    product = %item.product_ref,
                    "Stock deduction failed, oversell permitted: {e}"
                );
            } else {
                return Err(LedgerError::ResourceUnavailable(format!(
                    "stock deduction for {}: {e}",
                    item.product_ref
                )));
            }
        }
    }

    let updated = conn.execute(
        "UPDATE receipts SET
            state = 'settled', paid_amount = ?1, change_given = ?2,
            settled_at = ?3, version = version + 1, updated_at = ?3
         WHERE id = ?4 AND version = ?5",
        params![paid_amount, change, now, receipt.id, receipt.version],
    )?;
    if updated == 0 {
        return Err(LedgerError::ConcurrencyConflict {
            entity: "receipt",
            id: receipt.id.clone(),
        });
    }

    let receipt_payload = serde_json::json!({
        "receiptId": receipt.id,
        "total": receipt.total,
        "paidAmount": paid_amount,
        "change": change,
    })
    .to_string();
    outbox::enqueue(
        conn,
        outbox::KIND_PRINT_RECEIPT,
        &receipt.id,
        &receipt_payload,
        &format!("receipt:{}", receipt.id),
    )?;

    audit::append(
        conn,
        &AuditEntry {
            actor: receipt.owner_id.clone(),
            authorized_by: None,
            action: "receipt.settle".into(),
            entity_type: "receipt".into(),
            entity_id: receipt.id.clone(),
            before: serde_json::json!({
                "state": receipt.state.as_str(),
                "paidAmount": receipt.paid_amount,
            }),
            after: serde_json::json!({
                "state": "settled",
                "paidAmount": paid_amount,
                "change": change,
            }),
        },
    )?;

    Ok(())
}

fn commit_or_rollback<T>(conn: &Connection, result: LedgerResult<T>) -> LedgerResult<T> {
    match result {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ports::test_doubles::{RecordingInventory, StubGateway};
    use crate::testutil::{item, pending_receipt, test_db};

    fn tender(method: PaymentMethod, amount: f64) -> TenderInput {
        TenderInput {
            method,
            amount,
            reference: None,
        }
    }

    #[test]
    fn split_tender_exact_settles_with_zero_change() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 46.40)]);

        let outcome = settle(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            &[
                tender(PaymentMethod::Cash, 20.0),
                tender(PaymentMethod::Mpesa, 26.40),
            ],
        )
        .unwrap();

        assert_eq!(outcome.state, ReceiptState::Settled);
        assert!((outcome.change - 0.0).abs() < f64::EPSILON);
        assert!((outcome.paid_amount - 46.40).abs() < MONEY_EPSILON);
        assert_eq!(outcome.payment_ids.len(), 2);

        // Stock deducted exactly once
        assert_eq!(inventory.deductions.lock().unwrap().len(), 1);
    }

    #[test]
    fn cash_overpayment_computes_change() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 46.40)]);

        let outcome = settle(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            &[tender(PaymentMethod::Cash, 50.0)],
        )
        .unwrap();

        assert_eq!(outcome.state, ReceiptState::Settled);
        assert!((outcome.change - 3.60).abs() < MONEY_EPSILON);
    }

    #[test]
    fn insufficient_batch_fails_without_mutation() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 46.40)]);

        let err = settle(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            &[tender(PaymentMethod::Cash, 20.0)],
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientPayment { .. }));

        let after = crate::receipts::get_receipt(&db, &receipt.id).unwrap();
        assert_eq!(after.state, ReceiptState::Pending);
        assert!((after.paid_amount - 0.0).abs() < f64::EPSILON);
        assert!(payments_for_receipt(&db, &receipt.id).unwrap().is_empty());
    }

    #[test]
    fn partial_then_covering_tender() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        let partial = apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Card,
            10.0,
            None,
            "pay-1",
        )
        .unwrap();
        assert_eq!(partial.state, ReceiptState::Pending);
        assert!((partial.paid_amount - 10.0).abs() < f64::EPSILON);
        assert!(inventory.deductions.lock().unwrap().is_empty());

        let covering = apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Cash,
            20.0,
            None,
            "pay-2",
        )
        .unwrap();
        assert_eq!(covering.state, ReceiptState::Settled);
        assert!((covering.change - 0.0).abs() < f64::EPSILON);
        assert_eq!(inventory.deductions.lock().unwrap().len(), 1);
    }

    #[test]
    fn idempotency_replay_is_a_noop() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        let first = apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Cash,
            30.0,
            None,
            "retry-key",
        )
        .unwrap();
        assert!(!first.replayed);
        assert_eq!(first.state, ReceiptState::Settled);

        let replay = apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Cash,
            30.0,
            None,
            "retry-key",
        )
        .unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.payment_ids, first.payment_ids);

        let after = crate::receipts::get_receipt(&db, &receipt.id).unwrap();
        assert!(
            (after.paid_amount - 30.0).abs() < f64::EPSILON,
            "replay must not double-apply"
        );
        assert_eq!(payments_for_receipt(&db, &receipt.id).unwrap().len(), 1);
    }

    #[test]
    fn non_cash_cannot_exceed_balance() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        let err = apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Mpesa,
            35.0,
            None,
            "over-1",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn inventory_outage_rolls_back_the_settle() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        inventory.set_fail(true);
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        let err = apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Cash,
            30.0,
            None,
            "out-1",
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);

        // Nothing committed: receipt untouched, no payment row, no print job
        let after = crate::receipts::get_receipt(&db, &receipt.id).unwrap();
        assert_eq!(after.state, ReceiptState::Pending);
        assert!(payments_for_receipt(&db, &receipt.id).unwrap().is_empty());
        let conn = db.conn.lock().unwrap();
        let receipt_prints: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM side_effects WHERE kind = 'print_receipt'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(receipt_prints, 0);
    }

    #[test]
    fn oversell_flag_permits_settle_during_outage() {
        let db = test_db();
        let policy = LedgerPolicy {
            allow_oversell: true,
            ..LedgerPolicy::default()
        };
        let inventory = RecordingInventory::default();
        inventory.set_fail(true);
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        let outcome = apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Cash,
            30.0,
            None,
            "oversell-1",
        )
        .unwrap();
        assert_eq!(outcome.state, ReceiptState::Settled);
    }

    #[test]
    fn settle_enqueues_receipt_print_after_commit() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        apply_payment(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            PaymentMethod::Cash,
            30.0,
            None,
            "print-1",
        )
        .unwrap();

        let conn = db.conn.lock().unwrap();
        let entity: String = conn
            .query_row(
                "SELECT entity_id FROM side_effects
                 WHERE kind = 'print_receipt' AND status = 'pending'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(entity, receipt.id);
    }

    #[test]
    fn gateway_capture_confirm_and_cancel_flow() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let gateway = StubGateway::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        // Capture goes to authorizing; receipt is unchanged
        let initiated = apply_payment(
            &db,
            &policy,
            &inventory,
            Some(&gateway),
            &receipt.id,
            PaymentMethod::Mpesa,
            30.0,
            None,
            "gw-1",
        )
        .unwrap();
        assert_eq!(initiated.state, ReceiptState::Pending);
        let payment_id = &initiated.payment_ids[0];

        let pending = crate::receipts::get_receipt(&db, &receipt.id).unwrap();
        assert!((pending.paid_amount - 0.0).abs() < f64::EPSILON);

        // Confirmation settles the receipt
        let confirmed = confirm_payment(&db, &policy, &inventory, payment_id).unwrap();
        assert_eq!(confirmed.state, ReceiptState::Settled);

        // Cancellation after capture is rejected
        let err = cancel_payment(&db, payment_id, "owner-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn cancel_before_confirmation_leaves_receipt_unchanged() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let gateway = StubGateway::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);

        let initiated = apply_payment(
            &db,
            &policy,
            &inventory,
            Some(&gateway),
            &receipt.id,
            PaymentMethod::Card,
            30.0,
            None,
            "gw-2",
        )
        .unwrap();
        let payment_id = &initiated.payment_ids[0];

        cancel_payment(&db, payment_id, "owner-1").unwrap();

        let after = crate::receipts::get_receipt(&db, &receipt.id).unwrap();
        assert_eq!(after.state, ReceiptState::Pending);
        assert!((after.paid_amount - 0.0).abs() < f64::EPSILON);

        // A cancelled capture cannot be confirmed
        let err = confirm_payment(&db, &policy, &inventory, payment_id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn settling_a_voided_receipt_is_a_state_conflict() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("nyama", 1.0, 30.0)]);
        crate::receipts::void_receipt(
            &db,
            &policy,
            &inventory,
            &receipt.id,
            "spoiled",
            "owner-1",
            "sup-1",
        )
        .unwrap();

        let err = settle(
            &db,
            &policy,
            &inventory,
            None,
            &receipt.id,
            &[tender(PaymentMethod::Cash, 30.0)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }
}
