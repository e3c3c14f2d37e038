//! Typed domain records for Till Core.
//!
//! Everything is stored relationally keyed by stable UUID text ids;
//! lineage between receipts is expressed through one-directional id
//! columns (`parent_receipt_id`, `child_receipt_ids`), never object
//! references. Row mappers live next to the types they build.

use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};

// ---------------------------------------------------------------------------
// Work periods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodStatus {
    Open,
    Closed,
}

impl PeriodStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodStatus::Open => "open",
            PeriodStatus::Closed => "closed",
        }
    }
}

/// A shift: the boundary within which receipts are created and reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPeriod {
    pub id: String,
    pub status: PeriodStatus,
    pub opened_at: String,
    pub opened_by: String,
    pub closed_at: Option<String>,
    pub closed_by: Option<String>,
    pub opening_float: f64,
    pub closing_cash_count: Option<f64>,
    pub expected_cash: Option<f64>,
    pub variance: Option<f64>,
    pub z_report_number: Option<i64>,
}

impl WorkPeriod {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        Ok(WorkPeriod {
            id: row.get("id")?,
            status: if status == "open" {
                PeriodStatus::Open
            } else {
                PeriodStatus::Closed
            },
            opened_at: row.get("opened_at")?,
            opened_by: row.get("opened_by")?,
            closed_at: row.get("closed_at")?,
            closed_by: row.get("closed_by")?,
            opening_float: row.get("opening_float")?,
            closing_cash_count: row.get("closing_cash_count")?,
            expected_cash: row.get("expected_cash")?,
            variance: row.get("variance")?,
            z_report_number: row.get("z_report_number")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Orders and items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub work_period_id: String,
    pub owner_id: String,
    pub status: String,
    pub version: i64,
    pub created_at: String,
}

impl Order {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Order {
            id: row.get("id")?,
            work_period_id: row.get("work_period_id")?,
            owner_id: row.get("owner_id")?,
            status: row.get("status")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Input shape for adding a line to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemInput {
    pub product_ref: String,
    pub category: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub tax: f64,
}

/// A stored order line. `batch_number` records which add-on wave the line
/// arrived in so kitchen tickets can print only the new batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub product_ref: String,
    pub category: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub discount: f64,
    pub tax: f64,
    pub batch_number: i64,
    pub voided: bool,
}

impl OrderItem {
    /// Line total: quantity x unit_price - discount + tax.
    pub fn line_total(&self) -> f64 {
        self.quantity * self.unit_price - self.discount + self.tax
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(OrderItem {
            id: row.get("id")?,
            order_id: row.get("order_id")?,
            product_ref: row.get("product_ref")?,
            category: row.get("category")?,
            description: row.get("description")?,
            quantity: row.get("quantity")?,
            unit_price: row.get("unit_price")?,
            discount: row.get("discount")?,
            tax: row.get("tax")?,
            batch_number: row.get("batch_number")?,
            voided: row.get::<_, i64>("voided")? != 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptState {
    Created,
    Pending,
    Settled,
    Voided,
    Archived,
}

impl ReceiptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptState::Created => "created",
            ReceiptState::Pending => "pending",
            ReceiptState::Settled => "settled",
            ReceiptState::Voided => "voided",
            ReceiptState::Archived => "archived",
        }
    }

    pub(crate) fn parse(s: &str) -> LedgerResult<Self> {
        match s {
            "created" => Ok(ReceiptState::Created),
            "pending" => Ok(ReceiptState::Pending),
            "settled" => Ok(ReceiptState::Settled),
            "voided" => Ok(ReceiptState::Voided),
            "archived" => Ok(ReceiptState::Archived),
            other => Err(LedgerError::Validation(format!(
                "unknown receipt state: {other}"
            ))),
        }
    }

    /// Terminal states never transition back to pending/created.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReceiptState::Settled | ReceiptState::Voided | ReceiptState::Archived
        )
    }

    /// States from which items may still be added.
    pub fn is_mutable(&self) -> bool {
        matches!(self, ReceiptState::Created | ReceiptState::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub order_id: String,
    pub work_period_id: String,
    pub owner_id: String,
    pub state: ReceiptState,
    pub total: f64,
    pub paid_amount: f64,
    pub change_given: f64,
    pub parent_receipt_id: Option<String>,
    pub child_receipt_ids: Vec<String>,
    pub void_reason: Option<String>,
    pub voided_by: Option<String>,
    pub void_authorized_by: Option<String>,
    pub settled_at: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Receipt {
    pub fn remaining_balance(&self) -> f64 {
        self.total - self.paid_amount
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let state: String = row.get("state")?;
        let children: String = row.get("child_receipt_ids")?;
        Ok(Receipt {
            id: row.get("id")?,
            order_id: row.get("order_id")?,
            work_period_id: row.get("work_period_id")?,
            owner_id: row.get("owner_id")?,
            state: ReceiptState::parse(&state).unwrap_or(ReceiptState::Created),
            total: row.get("total")?,
            paid_amount: row.get("paid_amount")?,
            change_given: row.get("change_given")?,
            parent_receipt_id: row.get("parent_receipt_id")?,
            child_receipt_ids: serde_json::from_str(&children).unwrap_or_default(),
            void_reason: row.get("void_reason")?,
            voided_by: row.get("voided_by")?,
            void_authorized_by: row.get("void_authorized_by")?,
            settled_at: row.get("settled_at")?,
            version: row.get("version")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Payments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Mpesa,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Mpesa => "mpesa",
        }
    }

    pub fn parse(s: &str) -> LedgerResult<Self> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "mpesa" => Ok(PaymentMethod::Mpesa),
            other => Err(LedgerError::Validation(format!(
                "invalid payment method: {other}. Must be cash, card, or mpesa"
            ))),
        }
    }

    /// Only cash tenders produce change.
    pub fn gives_change(&self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Capture initiated through the gateway, awaiting confirmation.
    Authorizing,
    Completed,
    Failed,
    Cancelled,
    /// Settled payment reversed when its receipt was voided.
    Reversed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Authorizing => "authorizing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Reversed => "reversed",
        }
    }

    pub(crate) fn parse(s: &str) -> LedgerResult<Self> {
        match s {
            "authorizing" => Ok(PaymentStatus::Authorizing),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "reversed" => Ok(PaymentStatus::Reversed),
            other => Err(LedgerError::Validation(format!(
                "unknown payment status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub receipt_id: String,
    pub method: PaymentMethod,
    pub amount: f64,
    pub change_given: f64,
    pub reference: Option<String>,
    pub idempotency_key: String,
    pub status: PaymentStatus,
    pub created_at: String,
}

impl Payment {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let method: String = row.get("method")?;
        let status: String = row.get("status")?;
        Ok(Payment {
            id: row.get("id")?,
            receipt_id: row.get("receipt_id")?,
            method: PaymentMethod::parse(&method).unwrap_or(PaymentMethod::Cash),
            amount: row.get("amount")?,
            change_given: row.get("change_given")?,
            reference: row.get("reference")?,
            idempotency_key: row.get("idempotency_key")?,
            status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Completed),
            created_at: row.get("created_at")?,
        })
    }
}

/// A single tender in a batch settle call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenderInput {
    pub method: PaymentMethod,
    pub amount: f64,
    #[serde(default)]
    pub reference: Option<String>,
}

/// Outcome of applying one or more payments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementOutcome {
    pub receipt_id: String,
    pub payment_ids: Vec<String>,
    pub state: ReceiptState,
    pub paid_amount: f64,
    pub change: f64,
    /// True when an idempotency key replay returned the prior result.
    pub replayed: bool,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// One append-only audit record. `before`/`after` carry JSON snapshots of
/// the entity around the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub actor: String,
    pub authorized_by: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Money helpers
// ---------------------------------------------------------------------------

/// Tolerance for comparing stored monetary totals.
pub const MONEY_EPSILON: f64 = 0.01;

/// Convert a stored amount to minor currency units for exact division.
pub(crate) fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub(crate) fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

/// Round to cents; aggregate math stays on f64 like the rest of the
/// storage layer, split math goes through cents for exactness.
pub(crate) fn round_money(amount: f64) -> f64 {
    from_cents(to_cents(amount))
}
