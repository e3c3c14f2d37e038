//! Local SQLite storage layer for Till Core.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the
//! `local_settings` key/value store (which holds the durable Z-report
//! sequence counter), and the shared connection state used by every
//! ledger module.
//!
//! One database serves one register group; the connection mutex is the
//! per-process critical section that serializes ledger transactions.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{LedgerError, LedgerResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/till.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations.
pub fn init(data_dir: &Path) -> LedgerResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| LedgerError::ResourceUnavailable(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("till.db");
    info!("Opening ledger database at {}", db_path.display());

    let conn = open_and_configure(&db_path)?;
    run_migrations(&conn)?;

    info!("Ledger database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Initialize an in-memory database. Used by embedders for dry runs and
/// by the test suite.
pub fn init_in_memory() -> LedgerResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> LedgerResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Ledger schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating ledger schema from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: work periods, orders, receipts, payments, audit log,
/// staff, and the settings store.
fn migrate_v1(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- work_periods (shifts); never deleted
        CREATE TABLE IF NOT EXISTS work_periods (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'open',
            opened_at TEXT NOT NULL,
            opened_by TEXT NOT NULL,
            closed_at TEXT,
            closed_by TEXT,
            opening_float REAL NOT NULL DEFAULT 0,
            closing_cash_count REAL,
            expected_cash REAL,
            variance REAL,
            z_report_number INTEGER,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- orders
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            work_period_id TEXT NOT NULL REFERENCES work_periods(id),
            owner_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- order_items (one row per line; voided lines are kept)
        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id),
            product_ref TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'general',
            description TEXT NOT NULL DEFAULT '',
            quantity REAL NOT NULL,
            unit_price REAL NOT NULL,
            discount REAL NOT NULL DEFAULT 0,
            tax REAL NOT NULL DEFAULT 0,
            batch_number INTEGER NOT NULL DEFAULT 1,
            voided INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- receipts (state machine; lineage via id columns only)
        CREATE TABLE IF NOT EXISTS receipts (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id),
            work_period_id TEXT NOT NULL REFERENCES work_periods(id),
            owner_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'created',
            total REAL NOT NULL DEFAULT 0,
            paid_amount REAL NOT NULL DEFAULT 0,
            change_given REAL NOT NULL DEFAULT 0,
            parent_receipt_id TEXT,
            child_receipt_ids TEXT NOT NULL DEFAULT '[]',
            void_reason TEXT,
            voided_by TEXT,
            void_authorized_by TEXT,
            settled_at TEXT,
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- payments (idempotency_key dedupes client retries)
        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            receipt_id TEXT NOT NULL REFERENCES receipts(id),
            method TEXT NOT NULL,
            amount REAL NOT NULL,
            change_given REAL NOT NULL DEFAULT 0,
            reference TEXT,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'completed',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- audit_log (append-only; no update or delete path exists)
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            authorized_by TEXT,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            before_state TEXT NOT NULL DEFAULT 'null',
            after_state TEXT NOT NULL DEFAULT 'null',
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- staff (roles + bcrypt PIN hashes for override authorization)
        CREATE TABLE IF NOT EXISTS staff (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'cashier',
            pin_hash TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_work_periods_status ON work_periods(status);
        CREATE INDEX IF NOT EXISTS idx_orders_period ON orders(work_period_id);
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        CREATE INDEX IF NOT EXISTS idx_receipts_period ON receipts(work_period_id);
        CREATE INDEX IF NOT EXISTS idx_receipts_state ON receipts(state);
        CREATE INDEX IF NOT EXISTS idx_receipts_order ON receipts(order_id);
        CREATE INDEX IF NOT EXISTS idx_payments_receipt ON payments(receipt_id);
        CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        LedgerError::Storage(e)
    })?;
    Ok(())
}

/// Migration v2: override grants and frozen Z-report snapshots.
fn migrate_v2(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS override_grants (
            token TEXT PRIMARY KEY,
            receipt_id TEXT NOT NULL,
            requested_by TEXT NOT NULL,
            authorized_by TEXT NOT NULL,
            action TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            used_at TEXT
        );

        CREATE TABLE IF NOT EXISTS z_reports (
            id TEXT PRIMARY KEY,
            work_period_id TEXT UNIQUE NOT NULL REFERENCES work_periods(id),
            report_number INTEGER NOT NULL,
            report_json TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_override_grants_receipt ON override_grants(receipt_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        LedgerError::Storage(e)
    })?;
    Ok(())
}

/// Migration v3: transactional outbox for post-commit side effects.
fn migrate_v3(conn: &Connection) -> LedgerResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS side_effects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            next_retry_at TEXT,
            dispatched_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_side_effects_status ON side_effects(status);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        LedgerError::Storage(e)
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a value from `local_settings`, or None if missing.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Upsert a value into `local_settings`.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> LedgerResult<()> {
    let updated = conn.execute(
        "UPDATE local_settings SET setting_value = ?3, updated_at = datetime('now')
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key, value],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO local_settings (setting_category, setting_key, setting_value)
             VALUES (?1, ?2, ?3)",
            params![category, key, value],
        )?;
    }
    Ok(())
}

/// Read-and-increment a durable monotonic counter stored in
/// `local_settings`. Must be called inside the caller's transaction so
/// the increment commits (or rolls back) with the write that consumed it.
pub(crate) fn next_counter(conn: &Connection, category: &str, key: &str) -> LedgerResult<i64> {
    let current: i64 = get_setting(conn, category, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let next = current + 1;
    set_setting(conn, category, key, &next.to_string())?;
    Ok(next)
}

/// Acquire the connection guard, recovering from a poisoned mutex: a
/// thread that panicked mid-transaction leaves the connection usable
/// (SQLite rolls the open transaction back on the next BEGIN).
pub(crate) fn lock_conn(db: &DbState) -> std::sync::MutexGuard<'_, Connection> {
    match db.conn.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("connection mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
