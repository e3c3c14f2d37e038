//! Post-commit side effects for Till Core.
//!
//! Ledger transitions enqueue printing jobs into the `side_effects`
//! table inside their own transaction, so a row exists iff the
//! transition committed. A background worker drains pending rows and
//! hands them to the printing collaborator; failures increment
//! `retry_count` with exponential backoff and never touch ledger state.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::LedgerResult;
use crate::ports::TicketPrinter;

/// Effect kinds understood by the dispatch worker.
pub const KIND_PRINT_TICKET: &str = "print_ticket";
pub const KIND_PRINT_RECEIPT: &str = "print_receipt";

const DISPATCH_BATCH: usize = 20;

/// Enqueue one side effect inside the caller's open transaction.
/// Replays of the same idempotency key are silently ignored.
pub(crate) fn enqueue(
    conn: &Connection,
    kind: &str,
    entity_id: &str,
    payload: &str,
    idempotency_key: &str,
) -> LedgerResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO side_effects (kind, entity_id, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4)",
        params![kind, entity_id, payload, idempotency_key],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

struct DueEffect {
    id: i64,
    kind: String,
    entity_id: String,
    payload: String,
    retry_count: i64,
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Run one dispatch cycle: claim due rows, release the connection while
/// talking to the collaborator, then record outcomes. Returns the number
/// of effects dispatched successfully.
pub fn drain_once(db: &DbState, printer: &dyn TicketPrinter) -> LedgerResult<usize> {
    let due: Vec<DueEffect> = {
        let conn = db::lock_conn(db);
        let mut stmt = conn.prepare(
            "SELECT id, kind, entity_id, payload, retry_count
             FROM side_effects
             WHERE status = 'pending'
               AND retry_count < max_retries
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now_stamp(), DISPATCH_BATCH as i64], |row| {
            Ok(DueEffect {
                id: row.get(0)?,
                kind: row.get(1)?,
                entity_id: row.get(2)?,
                payload: row.get(3)?,
                retry_count: row.get(4)?,
            })
        })?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let mut dispatched = 0;

    for effect in due {
        // Collaborator call happens without holding the connection.
        let outcome = match effect.kind.as_str() {
            KIND_PRINT_TICKET => printer.print_ticket(&effect.entity_id, &effect.payload),
            KIND_PRINT_RECEIPT => printer.print_receipt(&effect.entity_id, &effect.payload),
            other => {
                warn!(kind = %other, id = effect.id, "Unknown side effect kind, dropping");
                let conn = db::lock_conn(db);
                conn.execute(
                    "UPDATE side_effects SET status = 'dead', last_error = 'unknown kind',
                        updated_at = ?1 WHERE id = ?2",
                    params![now_stamp(), effect.id],
                )?;
                continue;
            }
        };

        let conn = db::lock_conn(db);
        match outcome {
            Ok(()) => {
                conn.execute(
                    "UPDATE side_effects SET status = 'dispatched', dispatched_at = ?1,
                        last_error = NULL, updated_at = ?1
                     WHERE id = ?2",
                    params![now_stamp(), effect.id],
                )?;
                dispatched += 1;
            }
            Err(e) => {
                let new_retry = effect.retry_count + 1;
                let delay_secs = 2_i64.pow(new_retry.min(6) as u32);
                let next_retry = (Utc::now() + ChronoDuration::seconds(delay_secs))
                    .to_rfc3339_opts(SecondsFormat::Millis, true);
                let exhausted: bool = conn.query_row(
                    "UPDATE side_effects SET retry_count = ?1, last_error = ?2,
                        next_retry_at = ?3, updated_at = ?4,
                        status = CASE WHEN ?1 >= max_retries THEN 'dead' ELSE 'pending' END
                     WHERE id = ?5
                     RETURNING status = 'dead'",
                    params![new_retry, e.to_string(), next_retry, now_stamp(), effect.id],
                    |row| row.get(0),
                )?;
                if exhausted {
                    warn!(
                        id = effect.id,
                        kind = %effect.kind,
                        entity_id = %effect.entity_id,
                        error = %e,
                        "Side effect exhausted retries"
                    );
                } else {
                    warn!(
                        id = effect.id,
                        kind = %effect.kind,
                        retry = new_retry,
                        error = %e,
                        "Side effect failed, will retry"
                    );
                }
            }
        }
    }

    Ok(dispatched)
}

/// Spawn the background dispatch loop. Runs until the token is
/// cancelled; each tick drains due effects once.
pub fn spawn_worker(
    db: Arc<DbState>,
    printer: Arc<dyn TicketPrinter>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Side-effect worker started (interval: {:?})", interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Side-effect worker stopping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            match drain_once(&db, printer.as_ref()) {
                Ok(0) => {}
                Ok(n) => info!(dispatched = n, "Side effects dispatched"),
                Err(e) => warn!("Side-effect dispatch cycle failed: {e}"),
            }
        }
    })
}

/// Count of still-pending effects; used by close-of-day diagnostics.
pub fn pending_count(db: &DbState) -> LedgerResult<i64> {
    let conn = db::lock_conn(db);
    let count = conn.query_row(
        "SELECT COUNT(*) FROM side_effects WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::test_doubles::FlakyPrinter;
    use std::sync::atomic::Ordering;

    fn test_db() -> DbState {
        db::init_in_memory().expect("open in-memory db")
    }

    fn enqueue_direct(db: &DbState, kind: &str, entity_id: &str, key: &str) {
        let conn = db.conn.lock().unwrap();
        enqueue(&conn, kind, entity_id, "{}", key).unwrap();
    }

    #[test]
    fn drain_dispatches_pending_effects() {
        let db = test_db();
        let printer = FlakyPrinter::default();
        enqueue_direct(&db, KIND_PRINT_TICKET, "r-1", "ticket:r-1:1");
        enqueue_direct(&db, KIND_PRINT_RECEIPT, "r-1", "receipt:r-1");

        let dispatched = drain_once(&db, &printer).unwrap();
        assert_eq!(dispatched, 2);
        assert_eq!(printer.tickets.load(Ordering::SeqCst), 1);
        assert_eq!(printer.receipts.load(Ordering::SeqCst), 1);
        assert_eq!(pending_count(&db).unwrap(), 0);

        // Nothing left to do
        assert_eq!(drain_once(&db, &printer).unwrap(), 0);
    }

    #[test]
    fn replayed_idempotency_key_enqueues_once() {
        let db = test_db();
        enqueue_direct(&db, KIND_PRINT_TICKET, "r-2", "ticket:r-2:1");
        enqueue_direct(&db, KIND_PRINT_TICKET, "r-2", "ticket:r-2:1");
        assert_eq!(pending_count(&db).unwrap(), 1);
    }

    #[test]
    fn failure_backs_off_then_succeeds() {
        let db = test_db();
        let printer = FlakyPrinter::default();
        printer.failures_remaining.store(1, Ordering::SeqCst);
        enqueue_direct(&db, KIND_PRINT_RECEIPT, "r-3", "receipt:r-3");

        assert_eq!(drain_once(&db, &printer).unwrap(), 0);
        {
            let conn = db.conn.lock().unwrap();
            let (retry, status): (i64, String) = conn
                .query_row(
                    "SELECT retry_count, status FROM side_effects WHERE idempotency_key = 'receipt:r-3'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap();
            assert_eq!(retry, 1);
            assert_eq!(status, "pending");

            // Time-travel past the backoff window
            conn.execute(
                "UPDATE side_effects SET next_retry_at = '2000-01-01T00:00:00.000Z'",
                [],
            )
            .unwrap();
        }

        assert_eq!(drain_once(&db, &printer).unwrap(), 1);
        assert_eq!(printer.receipts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhausted_retries_move_to_dead() {
        let db = test_db();
        let printer = FlakyPrinter::default();
        printer.failures_remaining.store(100, Ordering::SeqCst);
        enqueue_direct(&db, KIND_PRINT_TICKET, "r-4", "ticket:r-4:1");

        for _ in 0..5 {
            drain_once(&db, &printer).unwrap();
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE side_effects SET next_retry_at = '2000-01-01T00:00:00.000Z'",
                [],
            )
            .unwrap();
        }

        let conn = db.conn.lock().unwrap();
        let status: String = conn
            .query_row(
                "SELECT status FROM side_effects WHERE idempotency_key = 'ticket:r-4:1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "dead");
    }

    #[tokio::test]
    async fn worker_drains_in_background() {
        let db = Arc::new(test_db());
        let printer = Arc::new(FlakyPrinter::default());
        enqueue_direct(&db, KIND_PRINT_TICKET, "r-5", "ticket:r-5:1");

        let cancel = CancellationToken::new();
        let handle = spawn_worker(
            db.clone(),
            printer.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        for _ in 0..50 {
            if printer.tickets.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(printer.tickets.load(Ordering::SeqCst), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
