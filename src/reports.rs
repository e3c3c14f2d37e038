//! X/Z report aggregation for Till Core.
//!
//! The X report is a read-only, re-runnable snapshot of a work period:
//! non-voided settled and pending receipts grouped by item category,
//! owner, and payment method. The Z report freezes that snapshot at
//! period close with the next number from the durable sequence counter;
//! successive Z numbers increase by exactly one with no gaps.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::models::WorkPeriod;

// ---------------------------------------------------------------------------
// Report shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryLine {
    pub category: String,
    pub quantity: f64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLine {
    pub user_id: String,
    pub receipts: i64,
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodLine {
    pub method: String,
    pub count: i64,
    /// Net amount taken (tendered minus change given).
    pub amount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XReport {
    pub work_period_id: String,
    pub generated_at: String,
    pub settled_count: i64,
    pub settled_total: f64,
    pub pending_count: i64,
    pub pending_total: f64,
    pub voided_count: i64,
    pub voided_total: f64,
    pub by_category: Vec<CategoryLine>,
    pub by_user: Vec<UserLine>,
    pub by_method: Vec<MethodLine>,
}

// ---------------------------------------------------------------------------
// X report
// ---------------------------------------------------------------------------

/// Build the X snapshot for a period. Read-only and re-runnable.
pub fn x_report(db: &DbState, period_id: &str) -> LedgerResult<XReport> {
    let conn = db::lock_conn(db);
    compute_x(&conn, period_id)
}

pub(crate) fn compute_x(conn: &Connection, period_id: &str) -> LedgerResult<XReport> {
    // Period must exist even when empty
    conn.query_row(
        "SELECT id FROM work_periods WHERE id = ?1",
        params![period_id],
        |_| Ok(()),
    )
    .map_err(|_| LedgerError::not_found("work_period", period_id))?;

    let (settled_count, settled_total) = state_aggregate(conn, period_id, "('settled')")?;
    let (pending_count, pending_total) =
        state_aggregate(conn, period_id, "('created', 'pending')")?;
    let (voided_count, voided_total) = state_aggregate(conn, period_id, "('voided')")?;

    // By item category, over non-voided lines of live receipts
    let mut cat_stmt = conn.prepare(
        "SELECT oi.category,
                COALESCE(SUM(oi.quantity), 0),
                COALESCE(SUM(oi.quantity * oi.unit_price - oi.discount + oi.tax), 0)
         FROM order_items oi
         JOIN receipts r ON r.order_id = oi.order_id
         WHERE r.work_period_id = ?1
           AND r.state IN ('settled', 'created', 'pending')
           AND oi.voided = 0
         GROUP BY oi.category
         ORDER BY oi.category",
    )?;
    let by_category = collect_rows(cat_stmt.query_map(params![period_id], |row| {
        Ok(CategoryLine {
            category: row.get(0)?,
            quantity: row.get(1)?,
            amount: row.get(2)?,
        })
    })?);

    // By receipt owner
    let mut user_stmt = conn.prepare(
        "SELECT owner_id, COUNT(*), COALESCE(SUM(total), 0)
         FROM receipts
         WHERE work_period_id = ?1 AND state IN ('settled', 'created', 'pending')
         GROUP BY owner_id
         ORDER BY owner_id",
    )?;
    let by_user = collect_rows(user_stmt.query_map(params![period_id], |row| {
        Ok(UserLine {
            user_id: row.get(0)?,
            receipts: row.get(1)?,
            amount: row.get(2)?,
        })
    })?);

    // By payment method, net of change
    let mut method_stmt = conn.prepare(
        "SELECT p.method, COUNT(*), COALESCE(SUM(p.amount - p.change_given), 0)
         FROM payments p
         JOIN receipts r ON r.id = p.receipt_id
         WHERE r.work_period_id = ?1 AND p.status = 'completed'
         GROUP BY p.method
         ORDER BY p.method",
    )?;
    let by_method = collect_rows(method_stmt.query_map(params![period_id], |row| {
        Ok(MethodLine {
            method: row.get(0)?,
            count: row.get(1)?,
            amount: row.get(2)?,
        })
    })?);

    Ok(XReport {
        work_period_id: period_id.to_string(),
        generated_at: Utc::now().to_rfc3339(),
        settled_count,
        settled_total,
        pending_count,
        pending_total,
        voided_count,
        voided_total,
        by_category,
        by_user,
        by_method,
    })
}

fn state_aggregate(
    conn: &Connection,
    period_id: &str,
    states: &str,
) -> LedgerResult<(i64, f64)> {
    // `states` is a static list baked into the query, never user input.
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(total), 0)
         FROM receipts WHERE work_period_id = ?1 AND state IN {states}"
    );
    let agg = conn.query_row(&sql, params![period_id], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })?;
    Ok(agg)
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Vec<T> {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(line) => out.push(line),
            Err(e) => warn!("skipping malformed report row: {e}"),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Cash movements
// ---------------------------------------------------------------------------

/// Net cash into and out of the drawer for the period:
/// `(cash_settlements, cash_payouts)`. Reversed payments count on both
/// sides, so a voided settled receipt nets to zero.
pub(crate) fn cash_movements(conn: &Connection, period_id: &str) -> LedgerResult<(f64, f64)> {
    let cash_in: f64 = conn.query_row(
        "SELECT COALESCE(SUM(p.amount - p.change_given), 0)
         FROM payments p
         JOIN receipts r ON r.id = p.receipt_id
         WHERE r.work_period_id = ?1
           AND p.method = 'cash'
           AND p.status IN ('completed', 'reversed')",
        params![period_id],
        |row| row.get(0),
    )?;
    let payouts: f64 = conn.query_row(
        "SELECT COALESCE(SUM(p.amount - p.change_given), 0)
         FROM payments p
         JOIN receipts r ON r.id = p.receipt_id
         WHERE r.work_period_id = ?1
           AND p.method = 'cash'
           AND p.status = 'reversed'",
        params![period_id],
        |row| row.get(0),
    )?;
    Ok((cash_in, payouts))
}

// ---------------------------------------------------------------------------
// Z report
// ---------------------------------------------------------------------------

/// Freeze the Z snapshot inside the close-period transaction. Assigns
/// the next sequence number; a second generation attempt for the same
/// period fails with `AlreadyGenerated`.
pub(crate) fn generate_z_in_txn(
    conn: &Connection,
    period: &WorkPeriod,
    closing_cash_count: f64,
    expected_cash: f64,
    variance: f64,
) -> LedgerResult<(i64, Value)> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM z_reports WHERE work_period_id = ?1",
            params![period.id],
            |row| row.get(0),
        )
        .ok();
    if existing.is_some() {
        return Err(LedgerError::AlreadyGenerated(period.id.clone()));
    }

    let report_number = db::next_counter(conn, "system", "z_sequence")?;
    let x = compute_x(conn, &period.id)?;
    let (cash_settlements, cash_payouts) = cash_movements(conn, &period.id)?;

    let snapshot = serde_json::json!({
        "reportNumber": report_number,
        "workPeriodId": period.id,
        "openedAt": period.opened_at,
        "openedBy": period.opened_by,
        "generatedAt": Utc::now().to_rfc3339(),
        "aggregates": serde_json::to_value(&x)
            .map_err(|e| LedgerError::Validation(format!("encode z snapshot: {e}")))?,
        "reconciliation": {
            "openingFloat": period.opening_float,
            "cashSettlements": cash_settlements,
            "cashPayouts": cash_payouts,
            "expectedCash": expected_cash,
            "closingCashCount": closing_cash_count,
            "variance": variance,
        },
    });

    conn.execute(
        "INSERT INTO z_reports (id, work_period_id, report_number, report_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            Uuid::new_v4().to_string(),
            period.id,
            report_number,
            snapshot.to_string()
        ],
    )?;

    info!(
        period_id = %period.id,
        report_number = report_number,
        "Z report frozen"
    );

    Ok((report_number, snapshot))
}

/// The frozen Z snapshot for a period, without recomputing anything.
pub fn get_z_report(db: &DbState, period_id: &str) -> LedgerResult<Value> {
    let conn = db::lock_conn(db);
    let report_json: String = conn
        .query_row(
            "SELECT report_json FROM z_reports WHERE work_period_id = ?1",
            params![period_id],
            |row| row.get(0),
        )
        .map_err(|_| LedgerError::not_found("z_report", period_id))?;
    serde_json::from_str(&report_json)
        .map_err(|e| LedgerError::Validation(format!("decode z snapshot: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================
