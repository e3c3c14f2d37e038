//! The receipt state machine for Till Core.
//!
//! Receipts move created -> pending -> settled, with voided and archived
//! as terminal branches. Split and merge archive their sources and spawn
//! new receipts; lineage is recorded through `parent_receipt_id` and
//! `child_receipt_ids`. Every mutation runs inside one IMMEDIATE
//! transaction, writes exactly one audit entry, and bumps the receipt's
//! optimistic version.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::db::{self, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::guard;
use crate::models::{
    from_cents, to_cents, AuditEntry, ItemInput, Order, OrderItem, Receipt, ReceiptState,
};
use crate::outbox;
use crate::policy::{LedgerPolicy, SettlementMode, VoidWindow};
use crate::ports::Inventory;

/// How a split divides the parent receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SplitAllocation {
    /// Each inner vec holds the item ids assigned to one child receipt.
    ByItem(Vec<Vec<String>>),
    /// Divide the total into `n` equal parts; the cent remainder goes to
    /// the first receipts in creation order.
    Equal(usize),
}

// ---------------------------------------------------------------------------
// Create order
// ---------------------------------------------------------------------------

/// Create an order with its first item batch in the open work period.
pub fn create_order(db: &DbState, owner_id: &str, items: &[ItemInput]) -> LedgerResult<Order> {
    validate_items(items)?;

    let conn = db::lock_conn(db);
    let period_id = open_period_id(&conn, "create_order")?;

    let order_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> LedgerResult<()> {
        conn.execute(
            "INSERT INTO orders (id, work_period_id, owner_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'open', ?4, ?4)",
            params![order_id, period_id, owner_id, now],
        )?;

        insert_items(&conn, &order_id, items, 1)?;

        audit::append(
            &conn,
            &AuditEntry {
                actor: owner_id.to_string(),
                authorized_by: None,
                action: "order.create".into(),
                entity_type: "order".into(),
                entity_id: order_id.clone(),
                before: serde_json::Value::Null,
                after: serde_json::json!({ "items": items.len(), "workPeriodId": period_id }),
            },
        )?;
        Ok(())
    })();

    commit_or_rollback(&conn, result)?;

    info!(order_id = %order_id, owner = %owner_id, items = items.len(), "Order created");
    fetch_order(&conn, &order_id)
}

// ---------------------------------------------------------------------------
// Create receipt
// ---------------------------------------------------------------------------

/// Commit an order to a receipt. The order becomes exclusively owned by
/// the receipt; the starting state follows the settlement mode.
pub fn create_receipt(
    db: &DbState,
    policy: &LedgerPolicy,
    order_id: &str,
    owner_id: &str,
) -> LedgerResult<Receipt> {
    let conn = db::lock_conn(db);

    let order = fetch_order(&conn, order_id)?;
    ensure_period_open(&conn, &order.work_period_id, "create_receipt")?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM receipts WHERE order_id = ?1 AND state != 'archived'",
            params![order_id],
            |row| row.get(0),
        )
        .ok();
    if let Some(receipt_id) = existing {
        return Err(LedgerError::state_conflict(
            "order",
            order_id,
            format!("committed to receipt {receipt_id}"),
            "create_receipt",
        ));
    }

    let state = match policy.settlement_mode {
        SettlementMode::AutoSettleOnPrint => ReceiptState::Pending,
        SettlementMode::Manual => ReceiptState::Created,
    };
    let total = order_total(&conn, order_id)?;
    let receipt_id = Uuid::new_v4().to_string();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> LedgerResult<()> {
        insert_receipt_row(
            &conn,
            &receipt_id,
            order_id,
            &order.work_period_id,
            owner_id,
            state,
            total,
            None,
        )?;

        // First kitchen ticket covers the order's opening batch.
        let first_batch = active_items(&conn, order_id)?;
        let ticket_payload = serde_json::to_string(&first_batch)
            .map_err(|e| LedgerError::Validation(format!("encode ticket payload: {e}")))?;
        outbox::enqueue(
            &conn,
            outbox::KIND_PRINT_TICKET,
            &receipt_id,
            &ticket_payload,
            &format!("ticket:{receipt_id}:1"),
        )?;

        audit::append(
            &conn,
            &AuditEntry {
                actor: owner_id.to_string(),
                authorized_by: None,
                action: "receipt.create".into(),
                entity_type: "receipt".into(),
                entity_id: receipt_id.clone(),
                before: serde_json::Value::Null,
                after: serde_json::json!({
                    "orderId": order_id,
                    "state": state.as_str(),
                    "total": total,
                }),
            },
        )?;
        Ok(())
    })();

    commit_or_rollback(&conn, result)?;

    info!(receipt_id = %receipt_id, order_id = %order_id, state = %state.as_str(), "Receipt created");
    fetch_receipt(&conn, &receipt_id)
}

// ---------------------------------------------------------------------------
// Add items
// ---------------------------------------------------------------------------

/// Add a batch of items to a mutable receipt. Returns only the newly
/// added items so kitchen tickets never re-emit earlier batches.
pub fn add_items(
    db: &DbState,
    policy: &LedgerPolicy,
    receipt_id: &str,
    items: &[ItemInput],
    acting_user: &str,
    grant_token: Option<&str>,
) -> LedgerResult<Vec<OrderItem>> {
    validate_items(items)?;

    with_conflict_retries(policy.conflict_retries, || {
        let conn = db::lock_conn(db);

        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> LedgerResult<Vec<OrderItem>> {
            let receipt = fetch_receipt(&conn, receipt_id)?;
            ensure_period_open(&conn, &receipt.work_period_id, "add_items")?;
            if !receipt.state.is_mutable() {
                return Err(LedgerError::state_conflict(
                    "receipt",
                    receipt_id,
                    receipt.state.as_str(),
                    "add_items",
                ));
            }

            // Grant consumption rolls back with a failed batch, so a
            // single-use grant is only spent by a committed mutation.
            let authorized_by = guard::ensure_can_modify(
                &conn,
                receipt_id,
                &receipt.owner_id,
                acting_user,
                grant_token,
            )?;

            let batch: i64 = conn.query_row(
                "SELECT COALESCE(MAX(batch_number), 0) + 1 FROM order_items WHERE order_id = ?1",
                params![receipt.order_id],
                |row| row.get(0),
            )?;

            let item_count_before: i64 = conn.query_row(
                "SELECT COUNT(*) FROM order_items WHERE order_id = ?1",
                params![receipt.order_id],
                |row| row.get(0),
            )?;

            insert_items(&conn, &receipt.order_id, items, batch)?;

            let total = order_total(&conn, &receipt.order_id)?;
            // First batch moves a manual-mode receipt onto the floor.
            let new_state = if receipt.state == ReceiptState::Created {
                ReceiptState::Pending
            } else {
                receipt.state
            };
            update_receipt_guarded(
                &conn,
                receipt_id,
                receipt.version,
                "state = ?3, total = ?4",
                params![
                    receipt_id,
                    receipt.version,
                    new_state.as_str(),
                    total,
                ],
            )?;

            let new_items = batch_items(&conn, &receipt.order_id, batch)?;

            let ticket_payload = serde_json::to_string(&new_items)
                .map_err(|e| LedgerError::Validation(format!("encode ticket payload: {e}")))?;
            outbox::enqueue(
                &conn,
                outbox::KIND_PRINT_TICKET,
                receipt_id,
                &ticket_payload,
                &format!("ticket:{receipt_id}:{batch}"),
            )?;

            audit::append(
                &conn,
                &AuditEntry {
                    actor: acting_user.to_string(),
                    authorized_by: authorized_by.clone(),
                    action: "receipt.add_items".into(),
                    entity_type: "receipt".into(),
                    entity_id: receipt_id.to_string(),
                    before: serde_json::json!({ "items": item_count_before, "total": receipt.total }),
                    after: serde_json::json!({
                        "items": item_count_before + items.len() as i64,
                        "total": total,
                        "batch": batch,
                    }),
                },
            )?;

            Ok(new_items)
        })();

        let new_items = commit_or_rollback(&conn, result)?;
        info!(
            receipt_id = %receipt_id,
            batch = new_items.first().map(|i| i.batch_number).unwrap_or_default(),
            added = new_items.len(),
            "Items added to receipt"
        );
        Ok(new_items)
    })
}

// ---------------------------------------------------------------------------
// Void a single line
// ---------------------------------------------------------------------------

/// Mark one line voided and recompute the receipt total. The line stays
/// queryable; aggregates exclude it.
pub fn void_item(
    db: &DbState,
    policy: &LedgerPolicy,
    receipt_id: &str,
    item_id: &str,
    acting_user: &str,
    grant_token: Option<&str>,
) -> LedgerResult<Receipt> {
    with_conflict_retries(policy.conflict_retries, || {
        let conn = db::lock_conn(db);

        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> LedgerResult<()> {
            let receipt = fetch_receipt(&conn, receipt_id)?;
            ensure_period_open(&conn, &receipt.work_period_id, "void_item")?;
            if !receipt.state.is_mutable() {
                return Err(LedgerError::state_conflict(
                    "receipt",
                    receipt_id,
                    receipt.state.as_str(),
                    "void_item",
                ));
            }

            let authorized_by = guard::ensure_can_modify(
                &conn,
                receipt_id,
                &receipt.owner_id,
                acting_user,
                grant_token,
            )?;

            let voided: i64 = conn
                .query_row(
                    "SELECT voided FROM order_items WHERE id = ?1 AND order_id = ?2",
                    params![item_id, receipt.order_id],
                    |row| row.get(0),
                )
                .map_err(|_| LedgerError::not_found("order_item", item_id))?;
            if voided != 0 {
                return Err(LedgerError::state_conflict(
                    "order_item",
                    item_id,
                    "voided",
                    "void_item",
                ));
            }

            conn.execute(
                "UPDATE order_items SET voided = 1 WHERE id = ?1",
                params![item_id],
            )?;

            let total = order_total(&conn, &receipt.order_id)?;
            update_receipt_guarded(
                &conn,
                receipt_id,
                receipt.version,
                "total = ?3",
                params![receipt_id, receipt.version, total],
            )?;

            audit::append(
                &conn,
                &AuditEntry {
                    actor: acting_user.to_string(),
                    authorized_by,
                    action: "receipt.void_item".into(),
                    entity_type: "receipt".into(),
                    entity_id: receipt_id.to_string(),
                    before: serde_json::json!({ "total": receipt.total }),
                    after: serde_json::json!({ "total": total, "itemId": item_id }),
                },
            )?;
            Ok(())
        })();

        commit_or_rollback(&conn, result)?;
        info!(receipt_id = %receipt_id, item_id = %item_id, "Line voided");
        fetch_receipt(&conn, receipt_id)
    })
}

// ---------------------------------------------------------------------------
// Void receipt
// ---------------------------------------------------------------------------

/// Void a receipt. Requires a non-empty reason and a supervisor-or-above
/// authorizer; settled receipts reverse their stock movements inside the
/// same transaction and their payments become reversed.
pub fn void_receipt(
    db: &DbState,
    policy: &LedgerPolicy,
    inventory: &dyn Inventory,
    receipt_id: &str,
    reason: &str,
    requesting_user: &str,
    authorizing_user: &str,
) -> LedgerResult<Receipt> {
    if reason.trim().is_empty() {
        return Err(LedgerError::Validation("void reason is required".into()));
    }

    with_conflict_retries(policy.conflict_retries, || {
        let conn = db::lock_conn(db);

        guard::evaluate(&conn, authorizing_user, guard::Action::VoidReceipt)?;

        let receipt = fetch_receipt(&conn, receipt_id)?;
        ensure_period_open(&conn, &receipt.work_period_id, "void_receipt")?;

        let voidable = match policy.void_window {
            VoidWindow::UntilPeriodClose => matches!(
                receipt.state,
                ReceiptState::Created | ReceiptState::Pending | ReceiptState::Settled
            ),
            VoidWindow::BeforeSettlementOnly => receipt.state.is_mutable(),
        };
        if !voidable {
            return Err(LedgerError::state_conflict(
                "receipt",
                receipt_id,
                receipt.state.as_str(),
                "void_receipt",
            ));
        }

        let was_settled = receipt.state == ReceiptState::Settled;
        let now = Utc::now().to_rfc3339();

        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> LedgerResult<()> {
            if was_settled {
                // Reverse the stock that was deducted at settle time.
                // Inside the transaction: if the collaborator is down and
                // oversell is not permitted, the whole void rolls back.
                for item in active_items(&conn, &receipt.order_id)? {
                    if let Err(e) =
                        inventory.reverse_stock(&item.product_ref, item.quantity, receipt_id)
                    {
                        if policy.allow_oversell {
                            warn!(
                                receipt_id = %receipt_id,
                                product = %item.product_ref,
                                "Stock reversal failed, oversell permitted: {e}"
                            );
                        } else {
                            return Err(LedgerError::ResourceUnavailable(format!(
                                "stock reversal for {}: {e}",
                                item.product_ref
                            )));
                        }
                    }
                }

                conn.execute(
                    "UPDATE payments SET status = 'reversed', updated_at = ?1
                     WHERE receipt_id = ?2 AND status = 'completed'",
                    params![now, receipt_id],
                )?;
            }

            let updated = conn.execute(
                "UPDATE receipts SET
                    state = 'voided', void_reason = ?1, voided_by = ?2,
                    void_authorized_by = ?3, version = version + 1, updated_at = ?4
                 WHERE id = ?5 AND version = ?6",
                params![
                    reason,
                    requesting_user,
                    authorizing_user,
                    now,
                    receipt_id,
                    receipt.version
                ],
            )?;
            if updated == 0 {
                return Err(LedgerError::ConcurrencyConflict {
                    entity: "receipt",
                    id: receipt_id.to_string(),
                });
            }

            audit::append(
                &conn,
                &AuditEntry {
                    actor: requesting_user.to_string(),
                    authorized_by: Some(authorizing_user.to_string()),
                    action: "receipt.void".into(),
                    entity_type: "receipt".into(),
                    entity_id: receipt_id.to_string(),
                    before: serde_json::json!({
                        "state": receipt.state.as_str(),
                        "total": receipt.total,
                        "paidAmount": receipt.paid_amount,
                    }),
                    after: serde_json::json!({
                        "state": "voided",
                        "reason": reason,
                        "stockReversed": was_settled,
                    }),
                },
            )?;
            Ok(())
        })();

        commit_or_rollback(&conn, result)?;

        info!(
            receipt_id = %receipt_id,
            reason = %reason,
            requested_by = %requesting_user,
            authorized_by = %authorizing_user,
            "Receipt voided"
        );
        fetch_receipt(&conn, receipt_id)
    })
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Split a pending receipt into new receipts. The parent archives with
/// its children recorded; children's totals always sum exactly to the
/// parent's total.
pub fn split_receipt(
    db: &DbState,
    policy: &LedgerPolicy,
    receipt_id: &str,
    allocation: &SplitAllocation,
    acting_user: &str,
    grant_token: Option<&str>,
) -> LedgerResult<Vec<Receipt>> {
    with_conflict_retries(policy.conflict_retries, || {
        let conn = db::lock_conn(db);

        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> LedgerResult<Vec<String>> {
            let receipt = fetch_receipt(&conn, receipt_id)?;
            ensure_period_open(&conn, &receipt.work_period_id, "split_receipt")?;
            if receipt.state != ReceiptState::Pending {
                return Err(LedgerError::state_conflict(
                    "receipt",
                    receipt_id,
                    receipt.state.as_str(),
                    "split_receipt",
                ));
            }

            let authorized_by = guard::ensure_can_modify(
                &conn,
                receipt_id,
                &receipt.owner_id,
                acting_user,
                grant_token,
            )?;

            let child_ids = match allocation {
                SplitAllocation::ByItem(groups) => {
                    split_by_item(&conn, &receipt, groups)?
                }
                SplitAllocation::Equal(n) => split_equal(&conn, &receipt, *n)?,
            };

            let children_json = serde_json::to_string(&child_ids)
                .map_err(|e| LedgerError::Validation(format!("encode children: {e}")))?;
            let updated = conn.execute(
                "UPDATE receipts SET
                    state = 'archived', child_receipt_ids = ?1,
                    version = version + 1, updated_at = ?2
                 WHERE id = ?3 AND version = ?4",
                params![
                    children_json,
                    Utc::now().to_rfc3339(),
                    receipt_id,
                    receipt.version
                ],
            )?;
            if updated == 0 {
                return Err(LedgerError::ConcurrencyConflict {
                    entity: "receipt",
                    id: receipt_id.to_string(),
                });
            }

            audit::append(
                &conn,
                &AuditEntry {
                    actor: acting_user.to_string(),
                    authorized_by,
                    action: "receipt.split".into(),
                    entity_type: "receipt".into(),
                    entity_id: receipt_id.to_string(),
                    before: serde_json::json!({
                        "state": "pending",
                        "total": receipt.total,
                    }),
                    after: serde_json::json!({
                        "state": "archived",
                        "children": child_ids,
                    }),
                },
            )?;

            Ok(child_ids)
        })();

        let child_ids = commit_or_rollback(&conn, result)?;

        info!(
            receipt_id = %receipt_id,
            children = child_ids.len(),
            "Receipt split"
        );

        child_ids
            .iter()
            .map(|id| fetch_receipt(&conn, id))
            .collect()
    })
}

/// By-item mode: every non-voided item lands in exactly one child.
fn split_by_item(
    conn: &Connection,
    parent: &Receipt,
    groups: &[Vec<String>],
) -> LedgerResult<Vec<String>> {
    if groups.len() < 2 {
        return Err(LedgerError::InvalidAllocation(
            "split needs at least two targets".into(),
        ));
    }

    let items = active_items(conn, &parent.order_id)?;
    let mut unassigned: std::collections::HashSet<&str> =
        items.iter().map(|i| i.id.as_str()).collect();

    for group in groups {
        if group.is_empty() {
            return Err(LedgerError::InvalidAllocation(
                "split target with no items".into(),
            ));
        }
        for item_id in group {
            if !unassigned.remove(item_id.as_str()) {
                return Err(LedgerError::InvalidAllocation(format!(
                    "item {item_id} is unknown, voided, or assigned twice"
                )));
            }
        }
    }
    if !unassigned.is_empty() {
        return Err(LedgerError::InvalidAllocation(format!(
            "{} items left unassigned",
            unassigned.len()
        )));
    }

    let now = Utc::now().to_rfc3339();
    let mut child_ids = Vec::with_capacity(groups.len());

    for group in groups {
        let child_order_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO orders (id, work_period_id, owner_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'open', ?4, ?4)",
            params![child_order_id, parent.work_period_id, parent.owner_id, now],
        )?;

        for item_id in group {
            conn.execute(
                "UPDATE order_items SET order_id = ?1 WHERE id = ?2",
                params![child_order_id, item_id],
            )?;
        }

        let total = order_total(conn, &child_order_id)?;
        let child_id = Uuid::new_v4().to_string();
        insert_receipt_row(
            conn,
            &child_id,
            &child_order_id,
            &parent.work_period_id,
            &parent.owner_id,
            ReceiptState::Pending,
            total,
            Some(&parent.id),
        )?;
        child_ids.push(child_id);
    }

    Ok(child_ids)
}

/// Equal-n mode: cents division with the remainder assigned one cent
/// each to the first children in creation order.
fn split_equal(conn: &Connection, parent: &Receipt, n: usize) -> LedgerResult<Vec<String>> {
    if n < 2 {
        return Err(LedgerError::InvalidAllocation(
            "equal split needs at least two parts".into(),
        ));
    }

    let total_cents = to_cents(parent.total);
    let base = total_cents / n as i64;
    let remainder = (total_cents % n as i64) as usize;

    let now = Utc::now().to_rfc3339();
    let mut child_ids = Vec::with_capacity(n);

    for k in 0..n {
        let share = from_cents(base + if k < remainder { 1 } else { 0 });

        let child_order_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO orders (id, work_period_id, owner_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'open', ?4, ?4)",
            params![child_order_id, parent.work_period_id, parent.owner_id, now],
        )?;
        conn.execute(
            "INSERT INTO order_items (
                id, order_id, product_ref, category, description,
                quantity, unit_price, discount, tax, batch_number
            ) VALUES (?1, ?2, 'split-share', 'split', ?3, 1, ?4, 0, 0, 1)",
            params![
                Uuid::new_v4().to_string(),
                child_order_id,
                format!("Equal split {}/{} of receipt {}", k + 1, n, parent.id),
                share,
            ],
        )?;

        let child_id = Uuid::new_v4().to_string();
        insert_receipt_row(
            conn,
            &child_id,
            &child_order_id,
            &parent.work_period_id,
            &parent.owner_id,
            ReceiptState::Pending,
            share,
            Some(&parent.id),
        )?;
        child_ids.push(child_id);
    }

    Ok(child_ids)
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge pending/created receipts from the same open period into one new
/// pending receipt holding the union of their items. Sources archive
/// pointing at the merged receipt.
pub fn merge_receipts(
    db: &DbState,
    policy: &LedgerPolicy,
    receipt_ids: &[String],
    acting_user: &str,
) -> LedgerResult<Receipt> {
    if receipt_ids.len() < 2 {
        return Err(LedgerError::Validation(
            "merge needs at least two receipts".into(),
        ));
    }
    {
        let mut seen = std::collections::HashSet::new();
        for id in receipt_ids {
            if !seen.insert(id.as_str()) {
                return Err(LedgerError::Validation(format!(
                    "receipt {id} listed twice in merge"
                )));
            }
        }
    }

    with_conflict_retries(policy.conflict_retries, || {
        let conn = db::lock_conn(db);

        let mut sources = Vec::with_capacity(receipt_ids.len());
        for id in receipt_ids {
            sources.push(fetch_receipt(&conn, id)?);
        }

        let period_id = sources[0].work_period_id.clone();
        ensure_period_open(&conn, &period_id, "merge_receipts")?;

        for source in &sources {
            if source.work_period_id != period_id {
                return Err(LedgerError::state_conflict(
                    "receipt",
                    &source.id,
                    "in a different work period",
                    "merge_receipts",
                ));
            }
            if !source.state.is_mutable() {
                return Err(LedgerError::state_conflict(
                    "receipt",
                    &source.id,
                    source.state.as_str(),
                    "merge_receipts",
                ));
            }
            if !guard::can_modify(&source.owner_id, acting_user) {
                return Err(LedgerError::AuthorizationDenied(format!(
                    "{acting_user} does not own receipt {}",
                    source.id
                )));
            }
        }

        let now = Utc::now().to_rfc3339();
        let merged_order_id = Uuid::new_v4().to_string();
        let merged_id = Uuid::new_v4().to_string();

        conn.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> LedgerResult<()> {
            conn.execute(
                "INSERT INTO orders (id, work_period_id, owner_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'open', ?4, ?4)",
                params![merged_order_id, period_id, acting_user, now],
            )?;

            // Union of all lines, voided ones included for queryability.
            for source in &sources {
                conn.execute(
                    "UPDATE order_items SET order_id = ?1 WHERE order_id = ?2",
                    params![merged_order_id, source.order_id],
                )?;
            }

            let total = order_total(&conn, &merged_order_id)?;
            insert_receipt_row(
                &conn,
                &merged_id,
                &merged_order_id,
                &period_id,
                acting_user,
                ReceiptState::Pending,
                total,
                None,
            )?;

            let sources_json = serde_json::to_string(receipt_ids)
                .map_err(|e| LedgerError::Validation(format!("encode sources: {e}")))?;
            conn.execute(
                "UPDATE receipts SET child_receipt_ids = ?1 WHERE id = ?2",
                params![sources_json, merged_id],
            )?;

            for source in &sources {
                let updated = conn.execute(
                    "UPDATE receipts SET
                        state = 'archived', parent_receipt_id = ?1,
                        version = version + 1, updated_at = ?2
                     WHERE id = ?3 AND version = ?4",
                    params![merged_id, now, source.id, source.version],
                )?;
                if updated == 0 {
                    return Err(LedgerError::ConcurrencyConflict {
                        entity: "receipt",
                        id: source.id.clone(),
                    });
                }
            }

            audit::append(
                &conn,
                &AuditEntry {
                    actor: acting_user.to_string(),
                    authorized_by: None,
                    action: "receipt.merge".into(),
                    entity_type: "receipt".into(),
                    entity_id: merged_id.clone(),
                    before: serde_json::json!({ "sources": receipt_ids }),
                    after: serde_json::json!({ "state": "pending", "total": total }),
                },
            )?;
            Ok(())
        })();

        commit_or_rollback(&conn, result)?;

        info!(
            merged_id = %merged_id,
            sources = receipt_ids.len(),
            "Receipts merged"
        );
        fetch_receipt(&conn, &merged_id)
    })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn get_receipt(db: &DbState, receipt_id: &str) -> LedgerResult<Receipt> {
    let conn = db::lock_conn(db);
    fetch_receipt(&conn, receipt_id)
}

/// All lines of the receipt's order, voided included, in batch order.
pub fn get_items(db: &DbState, receipt_id: &str) -> LedgerResult<Vec<OrderItem>> {
    let conn = db::lock_conn(db);
    let receipt = fetch_receipt(&conn, receipt_id)?;
    all_items(&conn, &receipt.order_id)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

pub(crate) fn fetch_receipt(conn: &Connection, receipt_id: &str) -> LedgerResult<Receipt> {
    conn.query_row(
        "SELECT * FROM receipts WHERE id = ?1",
        params![receipt_id],
        Receipt::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => LedgerError::not_found("receipt", receipt_id),
        other => LedgerError::Storage(other),
    })
}

pub(crate) fn fetch_order(conn: &Connection, order_id: &str) -> LedgerResult<Order> {
    conn.query_row(
        "SELECT * FROM orders WHERE id = ?1",
        params![order_id],
        Order::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => LedgerError::not_found("order", order_id),
        other => LedgerError::Storage(other),
    })
}

/// The open period's id, or a register-closed conflict.
pub(crate) fn open_period_id(conn: &Connection, operation: &'static str) -> LedgerResult<String> {
    conn.query_row(
        "SELECT id FROM work_periods WHERE status = 'open' LIMIT 1",
        [],
        |row| row.get(0),
    )
    .map_err(|_| LedgerError::state_conflict("register", "local", "closed", operation))
}

pub(crate) fn ensure_period_open(
    conn: &Connection,
    period_id: &str,
    operation: &'static str,
) -> LedgerResult<()> {
    let status: String = conn
        .query_row(
            "SELECT status FROM work_periods WHERE id = ?1",
            params![period_id],
            |row| row.get(0),
        )
        .map_err(|_| LedgerError::not_found("work_period", period_id))?;
    if status != "open" {
        return Err(LedgerError::state_conflict(
            "work_period",
            period_id,
            status,
            operation,
        ));
    }
    Ok(())
}

fn validate_items(items: &[ItemInput]) -> LedgerResult<()> {
    if items.is_empty() {
        return Err(LedgerError::Validation("at least one item required".into()));
    }
    for item in items {
        if item.quantity <= 0.0 {
            return Err(LedgerError::Validation(format!(
                "quantity must be positive for {}",
                item.product_ref
            )));
        }
        if item.unit_price < 0.0 {
            return Err(LedgerError::Validation(format!(
                "unit price cannot be negative for {}",
                item.product_ref
            )));
        }
        if item.discount < 0.0 || item.tax < 0.0 {
            return Err(LedgerError::Validation(format!(
                "discount and tax cannot be negative for {}",
                item.product_ref
            )));
        }
    }
    Ok(())
}

fn insert_items(
    conn: &Connection,
    order_id: &str,
    items: &[ItemInput],
    batch: i64,
) -> LedgerResult<()> {
    for item in items {
        conn.execute(
            "INSERT INTO order_items (
                id, order_id, product_ref, category, description,
                quantity, unit_price, discount, tax, batch_number
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                Uuid::new_v4().to_string(),
                order_id,
                item.product_ref,
                item.category,
                item.description,
                item.quantity,
                item.unit_price,
                item.discount,
                item.tax,
                batch,
            ],
        )?;
    }
    conn.execute(
        "UPDATE orders SET version = version + 1, updated_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), order_id],
    )?;
    Ok(())
}

/// Sum of non-voided line totals.
pub(crate) fn order_total(conn: &Connection, order_id: &str) -> LedgerResult<f64> {
    let total: f64 = conn.query_row(
        "SELECT COALESCE(SUM(quantity * unit_price - discount + tax), 0)
         FROM order_items WHERE order_id = ?1 AND voided = 0",
        params![order_id],
        |row| row.get(0),
    )?;
    Ok(total)
}

/// Non-voided lines, batch order.
pub(crate) fn active_items(conn: &Connection, order_id: &str) -> LedgerResult<Vec<OrderItem>> {
    items_where(conn, order_id, "AND voided = 0")
}

fn all_items(conn: &Connection, order_id: &str) -> LedgerResult<Vec<OrderItem>> {
    items_where(conn, order_id, "")
}

fn batch_items(conn: &Connection, order_id: &str, batch: i64) -> LedgerResult<Vec<OrderItem>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM order_items WHERE order_id = ?1 AND batch_number = ?2
         ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![order_id, batch], OrderItem::from_row)?;
    collect_items(rows)
}

fn items_where(conn: &Connection, order_id: &str, extra: &str) -> LedgerResult<Vec<OrderItem>> {
    let sql = format!(
        "SELECT * FROM order_items WHERE order_id = ?1 {extra}
         ORDER BY batch_number ASC, created_at ASC, id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![order_id], OrderItem::from_row)?;
    collect_items(rows)
}

fn collect_items(
    rows: impl Iterator<Item = rusqlite::Result<OrderItem>>,
) -> LedgerResult<Vec<OrderItem>> {
    let mut items = Vec::new();
    for row in rows {
        match row {
            Ok(item) => items.push(item),
            Err(e) => warn!("skipping malformed item row: {e}"),
        }
    }
    Ok(items)
}

#[allow(clippy::too_many_arguments)]
fn insert_receipt_row(
    conn: &Connection,
    receipt_id: &str,
    order_id: &str,
    period_id: &str,
    owner_id: &str,
    state: ReceiptState,
    total: f64,
    parent_receipt_id: Option<&str>,
) -> LedgerResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO receipts (
            id, order_id, work_period_id, owner_id, state, total,
            parent_receipt_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            receipt_id,
            order_id,
            period_id,
            owner_id,
            state.as_str(),
            total,
            parent_receipt_id,
            now,
        ],
    )?;
    Ok(())
}

/// Version-guarded receipt update. `set_clause` may reference ?3.. for
/// extra values; ?1 is the id and ?2 the expected version.
fn update_receipt_guarded(
    conn: &Connection,
    receipt_id: &str,
    expected_version: i64,
    set_clause: &str,
    params: impl rusqlite::Params,
) -> LedgerResult<()> {
    let sql = format!(
        "UPDATE receipts SET {set_clause}, version = version + 1,
            updated_at = datetime('now')
         WHERE id = ?1 AND version = ?2"
    );
    let updated = conn.execute(&sql, params)?;
    if updated == 0 {
        return Err(LedgerError::ConcurrencyConflict {
            entity: "receipt",
            id: receipt_id.to_string(),
        });
    }
    Ok(())
}

/// Bounded internal retry on version conflicts before surfacing them.
pub(crate) fn with_conflict_retries<T>(
    retries: u32,
    mut f: impl FnMut() -> LedgerResult<T>,
) -> LedgerResult<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!(attempt, "Retrying after concurrency conflict: {e}");
            }
            other => return other,
        }
    }
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
    use crate::models::MONEY_EPSILON;
    use crate::ports::test_doubles::RecordingInventory;
    use crate::testutil::{item, pending_receipt, seed_open_period, test_db};

    #[test]
    fn create_receipt_state_follows_settlement_mode() {
        let db = test_db();
        let manual = LedgerPolicy::default();
        let auto = LedgerPolicy {
            settlement_mode: SettlementMode::AutoSettleOnPrint,
            ..LedgerPolicy::default()
        };

        let order = create_order(&db, "owner-1", &[item("tea", 1.0, 2.5)]).unwrap();
        let receipt = create_receipt(&db, &manual, &order.id, "owner-1").unwrap();
        assert_eq!(receipt.state, ReceiptState::Created);
        assert!((receipt.total - 2.5).abs() < MONEY_EPSILON);

        let order2 = create_order(&db, "owner-1", &[item("coffee", 2.0, 3.0)]).unwrap();
        let receipt2 = create_receipt(&db, &auto, &order2.id, "owner-1").unwrap();
        assert_eq!(receipt2.state, ReceiptState::Pending);
    }

    #[test]
    fn order_can_back_only_one_receipt() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let order = create_order(&db, "owner-1", &[item("tea", 1.0, 2.5)]).unwrap();
        create_receipt(&db, &policy, &order.id, "owner-1").unwrap();
        let err = create_receipt(&db, &policy, &order.id, "owner-1").unwrap_err();
        assert!(matches!(err, LedgerError::StateConflict { .. }));
    }

    #[test]
    fn add_items_returns_only_new_batch_and_bumps_total() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("ugali", 1.0, 4.0)]);

        let new_items = add_items(
            &db,
            &policy,
            &receipt.id,
            &[item("sukuma", 2.0, 1.5), item("soda", 1.0, 1.0)],
            "owner-1",
            None,
        )
        .unwrap();

        assert_eq!(new_items.len(), 2, "only the new batch is returned");
        assert!(new_items.iter().all(|i| i.batch_number == 2));

        let updated = get_receipt(&db, &receipt.id).unwrap();
        assert!((updated.total - 8.0).abs() < MONEY_EPSILON);

        // Third wave gets batch 3
        let wave3 = add_items(
            &db,
            &policy,
            &receipt.id,
            &[item("chai", 1.0, 1.0)],
            "owner-1",
            None,
        )
        .unwrap();
        assert_eq!(wave3[0].batch_number, 3);
    }

    #[test]
    fn manual_receipt_moves_to_pending_on_first_batch() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let order = create_order(&db, "owner-1", &[item("tea", 1.0, 2.0)]).unwrap();
        let receipt = create_receipt(&db, &policy, &order.id, "owner-1").unwrap();
        assert_eq!(receipt.state, ReceiptState::Created);

        add_items(&db, &policy, &receipt.id, &[item("mandazi", 1.0, 0.5)], "owner-1", None)
            .unwrap();
        assert_eq!(
            get_receipt(&db, &receipt.id).unwrap().state,
            ReceiptState::Pending
        );
    }

    #[test]
    fn add_items_by_non_owner_requires_grant() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("tea", 1.0, 2.0)]);

        let err = add_items(
            &db,
            &policy,
            &receipt.id,
            &[item("cake", 1.0, 3.0)],
            "other-1",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::AuthorizationDenied(_)));

        let grant = guard::request_override(
            &db,
            &receipt.id,
            "other-1",
            "mgr-1",
            "1357",
            guard::Action::ModifyReceipt,
        )
        .unwrap();

        let added = add_items(
            &db,
            &policy,
            &receipt.id,
            &[item("cake", 1.0, 3.0)],
            "other-1",
            Some(&grant.token),
        )
        .unwrap();
        assert_eq!(added.len(), 1);

        // Audit carries both the requester and the authorizer
        let conn = db.conn.lock().unwrap();
        let entries = audit::entries_for(&conn, "receipt", &receipt.id).unwrap();
        let add_entry = entries
            .iter()
            .find(|e| e["action"] == "receipt.add_items" && e["actor"] == "other-1")
            .expect("override add audited");
        assert_eq!(add_entry["authorizedBy"], "mgr-1");
    }

    #[test]
    fn void_item_recomputes_total_and_keeps_line() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let receipt =
            pending_receipt(&db, "owner-1", &[item("tea", 1.0, 2.0), item("cake", 1.0, 3.0)]);

        let items = get_items(&db, &receipt.id).unwrap();
        let cake = items.iter().find(|i| i.product_ref == "cake").unwrap();

        let updated = void_item(&db, &policy, &receipt.id, &cake.id, "owner-1", None).unwrap();
        assert!((updated.total - 2.0).abs() < MONEY_EPSILON);

        let items = get_items(&db, &receipt.id).unwrap();
        assert_eq!(items.len(), 2, "voided line stays queryable");
        assert!(items.iter().any(|i| i.voided));
    }

    #[test]
    fn void_receipt_requires_reason_and_authorizer_role() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("tea", 1.0, 2.0)]);

        let err = void_receipt(&db, &policy, &inventory, &receipt.id, "  ", "owner-1", "sup-1")
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let err = void_receipt(
            &db,
            &policy,
            &inventory,
            &receipt.id,
            "customer left",
            "owner-1",
            "other-1",
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::AuthorizationDenied(_)));

        let voided = void_receipt(
            &db,
            &policy,
            &inventory,
            &receipt.id,
            "customer left",
            "owner-1",
            "sup-1",
        )
        .unwrap();
        assert_eq!(voided.state, ReceiptState::Voided);
        assert_eq!(voided.void_reason.as_deref(), Some("customer left"));
        assert_eq!(voided.voided_by.as_deref(), Some("owner-1"));
        assert_eq!(voided.void_authorized_by.as_deref(), Some("sup-1"));

        // Pending receipt had no stock deducted, so nothing reverses
        assert!(inventory.reversals.lock().unwrap().is_empty());

        // Audit entry carries both ids
        let conn = db.conn.lock().unwrap();
        let entries = audit::entries_for(&conn, "receipt", &receipt.id).unwrap();
        let void_entry = entries
            .iter()
            .find(|e| e["action"] == "receipt.void")
            .unwrap();
        assert_eq!(void_entry["actor"], "owner-1");
        assert_eq!(void_entry["authorizedBy"], "sup-1");
        assert_eq!(void_entry["after"]["reason"], "customer left");
    }

    #[test]
    fn double_void_rejected() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let inventory = RecordingInventory::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("tea", 1.0, 2.0)]);

        void_receipt(&db, &policy, &inventory, &receipt.id, "wrong order", "owner-1", "sup-1")
            .unwrap();
        let err = void_receipt(
            &db,
            &policy,
            &inventory,
            &receipt.id,
            "again",
            "owner-1",
            "sup-1",
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::StateConflict { .. }));
    }

    #[test]
    fn split_equal_sums_exactly_with_remainder_first() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("platter", 1.0, 30.0)]);

        let children = split_receipt(
            &db,
            &policy,
            &receipt.id,
            &SplitAllocation::Equal(3),
            "owner-1",
            None,
        )
        .unwrap();

        assert_eq!(children.len(), 3);
        let sum: f64 = children.iter().map(|c| c.total).sum();
        assert!((sum - 30.0).abs() < f64::EPSILON);
        for child in &children {
            assert_eq!(child.state, ReceiptState::Pending);
            assert_eq!(child.parent_receipt_id.as_deref(), Some(receipt.id.as_str()));
            assert!((child.total - 10.0).abs() < f64::EPSILON);
        }

        let parent = get_receipt(&db, &receipt.id).unwrap();
        assert_eq!(parent.state, ReceiptState::Archived);
        assert_eq!(parent.child_receipt_ids.len(), 3);
    }

    #[test]
    fn split_equal_remainder_is_deterministic() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("platter", 1.0, 10.0)]);

        let children = split_receipt(
            &db,
            &policy,
            &receipt.id,
            &SplitAllocation::Equal(3),
            "owner-1",
            None,
        )
        .unwrap();

        // 1000 cents / 3 = 333 remainder 1: first child carries the extra cent
        assert!((children[0].total - 3.34).abs() < f64::EPSILON);
        assert!((children[1].total - 3.33).abs() < f64::EPSILON);
        assert!((children[2].total - 3.33).abs() < f64::EPSILON);
        let sum: f64 = children.iter().map(|c| to_cents(c.total)).sum::<i64>() as f64 / 100.0;
        assert!((sum - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn split_by_item_moves_each_line_exactly_once() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let receipt = pending_receipt(
            &db,
            "owner-1",
            &[item("fish", 1.0, 12.0), item("rice", 1.0, 4.0), item("soda", 2.0, 1.0)],
        );
        let items = get_items(&db, &receipt.id).unwrap();
        let fish = items.iter().find(|i| i.product_ref == "fish").unwrap();
        let rice = items.iter().find(|i| i.product_ref == "rice").unwrap();
        let soda = items.iter().find(|i| i.product_ref == "soda").unwrap();

        let children = split_receipt(
            &db,
            &policy,
            &receipt.id,
            &SplitAllocation::ByItem(vec![
                vec![fish.id.clone()],
                vec![rice.id.clone(), soda.id.clone()],
            ]),
            "owner-1",
            None,
        )
        .unwrap();

        assert_eq!(children.len(), 2);
        assert!((children[0].total - 12.0).abs() < MONEY_EPSILON);
        assert!((children[1].total - 6.0).abs() < MONEY_EPSILON);
        let sum: f64 = children.iter().map(|c| c.total).sum();
        assert!((sum - receipt.total).abs() < MONEY_EPSILON);
    }

    #[test]
    fn split_by_item_rejects_omissions_and_duplicates() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let receipt =
            pending_receipt(&db, "owner-1", &[item("fish", 1.0, 12.0), item("rice", 1.0, 4.0)]);
        let items = get_items(&db, &receipt.id).unwrap();
        let fish = &items[0];
        let rice = &items[1];

        // Omitted item
        let err = split_receipt(
            &db,
            &policy,
            &receipt.id,
            &SplitAllocation::ByItem(vec![vec![fish.id.clone()], vec![]]),
            "owner-1",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAllocation(_)));

        // Duplicated item
        let err = split_receipt(
            &db,
            &policy,
            &receipt.id,
            &SplitAllocation::ByItem(vec![vec![fish.id.clone()], vec![fish.id.clone(), rice.id.clone()]]),
            "owner-1",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAllocation(_)));

        // Receipt untouched after failed splits
        assert_eq!(get_receipt(&db, &receipt.id).unwrap().state, ReceiptState::Pending);
    }

    #[test]
    fn merge_unions_items_and_archives_sources() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let a = pending_receipt(&db, "owner-1", &[item("burger", 1.0, 10.0)]);
        let b = pending_receipt(&db, "owner-1", &[item("pizza", 1.0, 15.0)]);

        let merged = merge_receipts(
            &db,
            &policy,
            &[a.id.clone(), b.id.clone()],
            "owner-1",
        )
        .unwrap();

        assert_eq!(merged.state, ReceiptState::Pending);
        assert!((merged.total - 25.0).abs() < MONEY_EPSILON);
        assert_eq!(merged.child_receipt_ids, vec![a.id.clone(), b.id.clone()]);

        let a_after = get_receipt(&db, &a.id).unwrap();
        let b_after = get_receipt(&db, &b.id).unwrap();
        assert_eq!(a_after.state, ReceiptState::Archived);
        assert_eq!(b_after.state, ReceiptState::Archived);
        assert_eq!(a_after.parent_receipt_id.as_deref(), Some(merged.id.as_str()));
        assert_eq!(b_after.parent_receipt_id.as_deref(), Some(merged.id.as_str()));

        let items = get_items(&db, &merged.id).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn archived_receipts_reject_further_mutation() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let a = pending_receipt(&db, "owner-1", &[item("burger", 1.0, 10.0)]);
        let b = pending_receipt(&db, "owner-1", &[item("pizza", 1.0, 15.0)]);
        merge_receipts(&db, &policy, &[a.id.clone(), b.id.clone()], "owner-1").unwrap();

        let err = add_items(&db, &policy, &a.id, &[item("soda", 1.0, 1.0)], "owner-1", None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::StateConflict { .. }));

        let err = merge_receipts(&db, &policy, &[a.id.clone(), b.id.clone()], "owner-1")
            .unwrap_err();
        assert!(matches!(err, LedgerError::StateConflict { .. }));
    }

    #[test]
    fn merge_rejects_cross_period_receipts() {
        let db = test_db();
        let policy = LedgerPolicy::default();
        let a = pending_receipt(&db, "owner-1", &[item("burger", 1.0, 10.0)]);

        // Close wp-1, open wp-2, create a receipt there
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE work_periods SET status = 'closed' WHERE id = 'wp-1'", [])
                .unwrap();
        }
        seed_open_period(&db, "wp-2");
        let b = pending_receipt(&db, "owner-1", &[item("pizza", 1.0, 15.0)]);

        let err = merge_receipts(&db, &policy, &[b.id.clone(), a.id.clone()], "owner-1")
            .unwrap_err();
        assert!(matches!(err, LedgerError::StateConflict { .. }));
    }

    #[test]
    fn concurrent_add_items_loses_nothing() {
        use std::sync::Arc;

        let db = Arc::new(test_db());
        let policy = LedgerPolicy::default();
        let receipt = pending_receipt(&db, "owner-1", &[item("starter", 1.0, 5.0)]);

        let mut handles = Vec::new();
        for t in 0..2 {
            let db = db.clone();
            let policy = policy.clone();
            let receipt_id = receipt.id.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..10 {
                    add_items(
                        &db,
                        &policy,
                        &receipt_id,
                        &[item(&format!("thread{t}-item{i}"), 1.0, 1.0)],
                        "owner-1",
                        None,
                    )
                    .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let items = get_items(&db, &receipt.id).unwrap();
        assert_eq!(items.len(), 21, "starter + 2 threads x 10 items");
        let total = get_receipt(&db, &receipt.id).unwrap().total;
        assert!((total - 25.0).abs() < MONEY_EPSILON);

        // Batches are strictly increasing with no duplicates beyond waves
        let mut product_refs: Vec<String> =
            items.iter().map(|i| i.product_ref.clone()).collect();
        product_refs.sort();
        product_refs.dedup();
        assert_eq!(product_refs.len(), 21, "no item lost or duplicated");
    }
}
