//! Append-only audit log for Till Core.
//!
//! `append` is the only write path into `audit_log`; entries are never
//! updated or deleted. Every state transition performed by the ledger
//! modules writes exactly one entry, inside the same transaction as the
//! transition itself.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::warn;

use crate::error::LedgerResult;
use crate::models::AuditEntry;

/// Append one entry. Callers pass the connection of their open
/// transaction so the entry commits (or rolls back) with the transition.
pub fn append(conn: &Connection, entry: &AuditEntry) -> LedgerResult<()> {
    conn.execute(
        "INSERT INTO audit_log (
            actor, authorized_by, action, entity_type, entity_id,
            before_state, after_state
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.actor,
            entry.authorized_by,
            entry.action,
            entry.entity_type,
            entry.entity_id,
            entry.before.to_string(),
            entry.after.to_string(),
        ],
    )?;
    Ok(())
}

/// All entries for an entity, oldest first.
pub fn entries_for(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> LedgerResult<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor, authorized_by, action, entity_type, entity_id,
                before_state, after_state, created_at
         FROM audit_log
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let rows = stmt.query_map(params![entity_type, entity_id], |row| {
        let before: String = row.get(6)?;
        let after: String = row.get(7)?;
        Ok(serde_json::json!({
            "id": row.get::<_, i64>(0)?,
            "actor": row.get::<_, String>(1)?,
            "authorizedBy": row.get::<_, Option<String>>(2)?,
            "action": row.get::<_, String>(3)?,
            "entityType": row.get::<_, String>(4)?,
            "entityId": row.get::<_, String>(5)?,
            "before": serde_json::from_str::<Value>(&before).unwrap_or(Value::Null),
            "after": serde_json::from_str::<Value>(&after).unwrap_or(Value::Null),
            "createdAt": row.get::<_, String>(8)?,
        }))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        match row {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!("skipping malformed audit row: {e}"),
        }
    }

    Ok(entries)
}
