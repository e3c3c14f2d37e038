//! Shared fixtures for the module tests: an in-memory database seeded
//! with a small staff roster and one open work period.

use rusqlite::params;

use crate::db::{self, DbState};
use crate::guard::{self, Role};
use crate::models::{ItemInput, Receipt};
use crate::policy::{LedgerPolicy, SettlementMode};
use crate::receipts;

pub(crate) fn test_db() -> DbState {
    let db = db::init_in_memory().expect("open in-memory db");
    guard::register_staff(&db, "owner-1", "Amina", Role::Cashier, None).unwrap();
    guard::register_staff(&db, "other-1", "Brian", Role::Cashier, None).unwrap();
    guard::register_staff(&db, "sup-1", "Otieno", Role::Supervisor, Some("2468")).unwrap();
    guard::register_staff(&db, "mgr-1", "Wanjiru", Role::Manager, Some("1357")).unwrap();
    seed_open_period(&db, "wp-1");
    db
}

pub(crate) fn seed_open_period(db: &DbState, id: &str) {
    let conn = db.conn.lock().unwrap();
    conn.execute(
        "INSERT INTO work_periods (id, status, opened_at, opened_by, opening_float)
         VALUES (?1, 'open', datetime('now'), 'mgr-1', 100.0)",
        params![id],
    )
    .unwrap();
}

pub(crate) fn item(product: &str, qty: f64, price: f64) -> ItemInput {
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

/// An order committed to a pending receipt owned by `owner`.
pub(crate) fn pending_receipt(db: &DbState, owner: &str, items: &[ItemInput]) -> Receipt {
    let policy = LedgerPolicy {
        settlement_mode: SettlementMode::AutoSettleOnPrint,
        ..LedgerPolicy::default()
    };
    let order = receipts::create_order(db, owner, items).unwrap();
    receipts::create_receipt(db, &policy, &order.id, owner).unwrap()
}
