//! Ownership and authorization for Till Core.
//!
//! All permission decisions happen here, at the ledger boundary: role
//! checks for period operations, the owner lock on receipts, and
//! manager-PIN override grants. Grants are single-use tokens persisted in
//! `override_grants`; both the requester and the authorizer are audited
//! regardless of outcome.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::db::{self, DbState};
use crate::error::{LedgerError, LedgerResult};
use crate::models::AuditEntry;

// ---------------------------------------------------------------------------
// Roles and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Cashier,
    Server,
    Supervisor,
    Manager,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Cashier => "cashier",
            Role::Server => "server",
            Role::Supervisor => "supervisor",
            Role::Manager => "manager",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> LedgerResult<Self> {
        match s {
            "cashier" => Ok(Role::Cashier),
            "server" => Ok(Role::Server),
            "supervisor" => Ok(Role::Supervisor),
            "manager" => Ok(Role::Manager),
            "admin" => Ok(Role::Admin),
            other => Err(LedgerError::Validation(format!("unknown role: {other}"))),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Role::Cashier => 1,
            Role::Server => 1,
            Role::Supervisor => 2,
            Role::Manager => 3,
            Role::Admin => 4,
        }
    }
}

/// Ledger operations that carry a role requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    OpenPeriod,
    ClosePeriod,
    ModifyReceipt,
    VoidReceipt,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::OpenPeriod => "open_period",
            Action::ClosePeriod => "close_period",
            Action::ModifyReceipt => "modify_receipt",
            Action::VoidReceipt => "void_receipt",
        }
    }

    fn required_rank(&self) -> u8 {
        match self {
            Action::OpenPeriod | Action::ClosePeriod => Role::Manager.rank(),
            Action::VoidReceipt => Role::Supervisor.rank(),
            Action::ModifyReceipt => Role::Cashier.rank(),
        }
    }
}

/// Single-use permission escalation returned by [`request_override`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideGrant {
    pub token: String,
    pub receipt_id: String,
    pub requested_by: String,
    pub authorized_by: String,
    pub action: Action,
}

// ---------------------------------------------------------------------------
// Staff registry
// ---------------------------------------------------------------------------

/// Register a staff member. The PIN, when given, is stored as a bcrypt
/// hash and is what authorizes overrides.
pub fn register_staff(
    db: &DbState,
    staff_id: &str,
    display_name: &str,
    role: Role,
    pin: Option<&str>,
) -> LedgerResult<()> {
    let pin_hash = match pin {
        Some(pin) => {
            if pin.len() < 4 {
                return Err(LedgerError::Validation(
                    "PIN must be at least 4 digits".into(),
                ));
            }
            Some(
                bcrypt::hash(pin, bcrypt::DEFAULT_COST)
                    .map_err(|e| LedgerError::Validation(format!("hash PIN: {e}")))?,
            )
        }
        None => None,
    };

    let conn = db::lock_conn(db);
    conn.execute(
        "INSERT INTO staff (id, display_name, role, pin_hash) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET display_name = ?2, role = ?3,
            pin_hash = COALESCE(?4, pin_hash)",
        params![staff_id, display_name, role.as_str(), pin_hash],
    )?;
    info!(staff_id = %staff_id, role = %role.as_str(), "Staff registered");
    Ok(())
}

pub(crate) fn role_of(conn: &Connection, user_id: &str) -> LedgerResult<Role> {
    let role: String = conn
        .query_row(
            "SELECT role FROM staff WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .map_err(|_| LedgerError::not_found("staff", user_id))?;
    Role::parse(&role)
}

// ---------------------------------------------------------------------------
// Permission evaluation
// ---------------------------------------------------------------------------

/// True iff the user is the receipt's owner. The owner lock.
pub fn can_modify(receipt_owner: &str, user_id: &str) -> bool {
    receipt_owner == user_id
}

/// The single permission check point: deny unless the user's role meets
/// the action's minimum rank.
pub fn evaluate(conn: &Connection, user_id: &str, action: Action) -> LedgerResult<()> {
    let role = role_of(conn, user_id)?;
    if role.rank() < action.required_rank() {
        return Err(LedgerError::AuthorizationDenied(format!(
            "{} requires a higher role than {} held by {user_id}",
            action.as_str(),
            role.as_str(),
        )));
    }
    Ok(())
}

/// Ownership check used inside receipt mutations. Returns the authorizer
/// id when a grant was consumed, None for plain owner access.
pub(crate) fn ensure_can_modify(
    conn: &Connection,
    receipt_id: &str,
    receipt_owner: &str,
    acting_user: &str,
    grant_token: Option<&str>,
) -> LedgerResult<Option<String>> {
    if can_modify(receipt_owner, acting_user) {
        return Ok(None);
    }
    match grant_token {
        Some(token) => consume_grant(conn, token, receipt_id, acting_user).map(Some),
        None => Err(LedgerError::AuthorizationDenied(format!(
            "{acting_user} does not own receipt {receipt_id} and presented no override grant"
        ))),
    }
}

/// Mark a grant used. Exactly one consume succeeds per token; the row
/// must match the receipt and the original requester.
fn consume_grant(
    conn: &Connection,
    token: &str,
    receipt_id: &str,
    requesting_user: &str,
) -> LedgerResult<String> {
    let authorized_by: Option<String> = conn
        .query_row(
            "SELECT authorized_by FROM override_grants
             WHERE token = ?1 AND receipt_id = ?2 AND requested_by = ?3 AND used = 0",
            params![token, receipt_id, requesting_user],
            |row| row.get(0),
        )
        .ok();

    let authorized_by = authorized_by.ok_or_else(|| {
        LedgerError::AuthorizationDenied(format!(
            "override grant invalid or already used for receipt {receipt_id}"
        ))
    })?;

    conn.execute(
        "UPDATE override_grants SET used = 1, used_at = ?1 WHERE token = ?2",
        params![Utc::now().to_rfc3339(), token],
    )?;

    Ok(authorized_by)
}

// ---------------------------------------------------------------------------
// Override requests
// ---------------------------------------------------------------------------

/// Request a single-use override for a receipt the requester does not
/// own. The authorizer proves presence with their PIN and must hold a
/// higher role than the action requires. Both ids are audited whether or
/// not the request succeeds.
pub fn request_override(
    db: &DbState,
    receipt_id: &str,
    requesting_user: &str,
    authorizer_id: &str,
    authorizer_pin: &str,
    action: Action,
) -> LedgerResult<OverrideGrant> {
    let conn = db::lock_conn(db);

    let outcome = validate_authorizer(&conn, authorizer_id, authorizer_pin, action);

    // Audit the attempt regardless of outcome.
    let granted = outcome.is_ok();
    audit::append(
        &conn,
        &AuditEntry {
            actor: requesting_user.to_string(),
            authorized_by: Some(authorizer_id.to_string()),
            action: "override.request".into(),
            entity_type: "receipt".into(),
            entity_id: receipt_id.to_string(),
            before: serde_json::Value::Null,
            after: serde_json::json!({
                "action": action.as_str(),
                "granted": granted,
            }),
        },
    )?;

    outcome?;

    let token = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO override_grants (token, receipt_id, requested_by, authorized_by, action)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            token,
            receipt_id,
            requesting_user,
            authorizer_id,
            action.as_str()
        ],
    )?;

    info!(
        receipt_id = %receipt_id,
        requested_by = %requesting_user,
        authorized_by = %authorizer_id,
        action = %action.as_str(),
        "Override granted"
    );

    Ok(OverrideGrant {
        token,
        receipt_id: receipt_id.to_string(),
        requested_by: requesting_user.to_string(),
        authorized_by: authorizer_id.to_string(),
        action,
    })
}

fn validate_authorizer(
    conn: &Connection,
    authorizer_id: &str,
    pin: &str,
    action: Action,
) -> LedgerResult<()> {
    let (role, pin_hash): (String, Option<String>) = conn
        .query_row(
            "SELECT role, pin_hash FROM staff WHERE id = ?1",
            params![authorizer_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| LedgerError::not_found("staff", authorizer_id))?;

    let pin_hash = pin_hash.ok_or_else(|| {
        LedgerError::AuthorizationDenied(format!("{authorizer_id} has no PIN configured"))
    })?;

    let valid = bcrypt::verify(pin, &pin_hash)
        .map_err(|e| LedgerError::Validation(format!("verify PIN: {e}")))?;
    if !valid {
        warn!(authorizer = %authorizer_id, "Override rejected: invalid PIN");
        return Err(LedgerError::AuthorizationDenied("invalid PIN".into()));
    }

    let role = Role::parse(&role)?;
    if role.rank() <= action.required_rank() {
        return Err(LedgerError::AuthorizationDenied(format!(
            "{} cannot authorize {} overrides",
            role.as_str(),
            action.as_str(),
        )));
    }

    Ok(())
}
