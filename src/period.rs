//! Work period (shift) lifecycle for Till Core.
//!
//! One period is open at a time per register. Opening requires a
//! manager; closing reconciles the drawer, freezes the Z snapshot, and
//! locks every receipt under the period from further mutation.
//!
//! Closing is the single-writer operation of the system: it acquires the
//! connection with a bounded try-lock loop so it can never interleave
//! with an in-flight ledger transaction, and fails with the retryable
//! `PeriodBusy` under sustained contention instead of racing.

use chrono::Utc;
use rusqlite::{params, Connection};
use std::sync::TryLockError;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::db::{self, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::guard;
use crate::models::{AuditEntry, WorkPeriod};
use crate::policy::{LedgerPolicy, UnsettledClosePolicy};
use crate::reports;

/// How long `close_period` keeps trying for the connection before
/// giving up with `PeriodBusy` (25 x 10ms).
const CLOSE_LOCK_ATTEMPTS: u32 = 25;
const CLOSE_LOCK_WAIT: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Open period
// ---------------------------------------------------------------------------

/// Open a new work period with the given cash float.
pub fn open_period(db: &DbState, opening_float: f64, user_id: &str) -> LedgerResult<WorkPeriod> {
    if opening_float < 0.0 {
        return Err(LedgerError::Validation(
            "opening float cannot be negative".into(),
        ));
    }

    let conn = db::lock_conn(db);
    guard::evaluate(&conn, user_id, guard::Action::OpenPeriod)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM work_periods WHERE status = 'open' LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();
    if let Some(open_id) = existing {
        return Err(LedgerError::AlreadyOpen(open_id));
    }

    let period_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> LedgerResult<()> {
        conn.execute(
            "INSERT INTO work_periods (
                id, status, opened_at, opened_by, opening_float, created_at, updated_at
            ) VALUES (?1, 'open', ?2, ?3, ?4, ?2, ?2)",
            params![period_id, now, user_id, opening_float],
        )?;

        audit::append(
            &conn,
            &AuditEntry {
                actor: user_id.to_string(),
                authorized_by: None,
                action: "period.open".into(),
                entity_type: "work_period".into(),
                entity_id: period_id.clone(),
                before: serde_json::Value::Null,
                after: serde_json::json!({
                    "status": "open",
                    "openingFloat": opening_float,
                }),
            },
        )?;
        Ok(())
    })();

    commit_or_rollback(&conn, result)?;

    info!(period_id = %period_id, opened_by = %user_id, opening_float = %opening_float, "Work period opened");
    fetch_period(&conn, &period_id)
}

// ---------------------------------------------------------------------------
// Close period
// ---------------------------------------------------------------------------

/// Close the open work period: reconcile cash, freeze the Z snapshot,
/// and lock the period's receipts.
///
/// expected = opening_float + cash_settlements - cash_payouts
/// variance = closing_cash_count - expected
pub fn close_period(
    db: &DbState,
    policy: &LedgerPolicy,
    closing_cash_count: f64,
    user_id: &str,
) -> LedgerResult<WorkPeriod> {
    if closing_cash_count < 0.0 {
        return Err(LedgerError::Validation(
            "closing cash count cannot be negative".into(),
        ));
    }

    // Exclusive acquisition: an in-flight settle/void/split/merge holds
    // the connection for the span of its transaction; wait it out
    // briefly, then surface the retryable busy error.
    let conn = try_lock_conn(db)?;

    guard::evaluate(&conn, user_id, guard::Action::ClosePeriod)?;

    let period = match active_period_row(&conn)? {
        Some(period) => period,
        None => {
            let last_closed: Option<String> = conn
                .query_row(
                    "SELECT id FROM work_periods WHERE status = 'closed'
                     ORDER BY closed_at DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .ok();
            return Err(match last_closed {
                Some(id) => LedgerError::AlreadyClosed(id),
                None => LedgerError::not_found("work_period", "open"),
            });
        }
    };

    let unsettled: i64 = conn.query_row(
        "SELECT COUNT(*) FROM receipts
         WHERE work_period_id = ?1 AND state IN ('created', 'pending')",
        params![period.id],
        |row| row.get(0),
    )?;
    if unsettled > 0 {
        match policy.unsettled_at_close {
            UnsettledClosePolicy::Block => {
                return Err(LedgerError::UnsettledReceipts {
                    period_id: period.id,
                    count: unsettled,
                });
            }
            UnsettledClosePolicy::WarnAndClose => {
                warn!(
                    period_id = %period.id,
                    unsettled = unsettled,
                    "Closing period with unsettled receipts"
                );
            }
        }
    }

    let (cash_settlements, cash_payouts) = reports::cash_movements(&conn, &period.id)?;
    let expected = period.opening_float + cash_settlements - cash_payouts;
    let variance = closing_cash_count - expected;
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")?;

    let result = (|| -> LedgerResult<i64> {
        let (report_number, _snapshot) =
            reports::generate_z_in_txn(&conn, &period, closing_cash_count, expected, variance)?;

        conn.execute(
            "UPDATE work_periods SET
                status = 'closed', closed_at = ?1, closed_by = ?2,
                closing_cash_count = ?3, expected_cash = ?4, variance = ?5,
                z_report_number = ?6, updated_at = ?1
             WHERE id = ?7 AND status = 'open'",
            params![
                now,
                user_id,
                closing_cash_count,
                expected,
                variance,
                report_number,
                period.id,
            ],
        )?;

        audit::append(
            &conn,
            &AuditEntry {
                actor: user_id.to_string(),
                authorized_by: None,
                action: "period.close".into(),
                entity_type: "work_period".into(),
                entity_id: period.id.clone(),
                before: serde_json::json!({
                    "status": "open",
                    "openingFloat": period.opening_float,
                }),
                after: serde_json::json!({
                    "status": "closed",
                    "closingCashCount": closing_cash_count,
                    "expectedCash": expected,
                    "variance": variance,
                    "zReportNumber": report_number,
                    "unsettled": unsettled,
                }),
            },
        )?;

        Ok(report_number)
    })();

    let report_number = commit_or_rollback(&conn, result)?;

    info!(
        period_id = %period.id,
        closed_by = %user_id,
        expected = %expected,
        variance = %variance,
        z_report_number = report_number,
        "Work period closed"
    );

    fetch_period(&conn, &period.id)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn is_open(db: &DbState) -> LedgerResult<bool> {
    let conn = db::lock_conn(db);
    Ok(active_period_row(&conn)?.is_some())
}

pub fn active_period(db: &DbState) -> LedgerResult<Option<WorkPeriod>> {
    let conn = db::lock_conn(db);
    active_period_row(&conn)
}

pub fn get_period(db: &DbState, period_id: &str) -> LedgerResult<WorkPeriod> {
    let conn = db::lock_conn(db);
    fetch_period(&conn, period_id)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn try_lock_conn(db: &DbState) -> LedgerResult<std::sync::MutexGuard<'_, rusqlite::Connection>> {
    for _ in 0..CLOSE_LOCK_ATTEMPTS {
        match db.conn.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                warn!("connection mutex poisoned, recovering");
                return Ok(poisoned.into_inner());
            }
            Err(TryLockError::WouldBlock) => std::thread::sleep(CLOSE_LOCK_WAIT),
        }
    }
    Err(LedgerError::PeriodBusy("active".into()))
}

fn active_period_row(conn: &Connection) -> LedgerResult<Option<WorkPeriod>> {
    match conn.query_row(
        "SELECT * FROM work_periods WHERE status = 'open' LIMIT 1",
        [],
        WorkPeriod::from_row,
    ) {
        Ok(period) => Ok(Some(period)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(LedgerError::Storage(e)),
    }
}

fn fetch_period(conn: &Connection, period_id: &str) -> LedgerResult<WorkPeriod> {
    conn.query_row(
        "SELECT * FROM work_periods WHERE id = ?1",
        params![period_id],
        WorkPeriod::from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => LedgerError::not_found("work_period", period_id),
        other => LedgerError::Storage(other),
    })
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
