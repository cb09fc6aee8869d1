//! Invoice model for lab-billing-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::{validate_non_negative, validate_percentage, Payment, Record, RecordTest};

/// Collection status of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Partial,
    Paid,
    Overdue,
    Cancelled,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Partial => "partial",
            PaymentState::Paid => "paid",
            PaymentState::Overdue => "overdue",
            PaymentState::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "partial" => PaymentState::Partial,
            "paid" => PaymentState::Paid,
            "overdue" => PaymentState::Overdue,
            "cancelled" => PaymentState::Cancelled,
            _ => PaymentState::Pending,
        }
    }

    /// States that are set by staff rather than derived from amounts.
    pub fn is_manual_override(&self) -> bool {
        matches!(self, PaymentState::Overdue | PaymentState::Cancelled)
    }
}

/// Billing document aggregating one or more records.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub invoice_number: String,
    pub customer_id: Option<Uuid>,
    pub orderer_id: Option<Uuid>,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub subtotal: Decimal,
    pub tax_rate: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub invoice_additional_charges: Decimal,
    pub total_amount: Decimal,
    pub amount_paid: Decimal,
    pub amount_remaining: Decimal,
    pub payment_state: String,
    pub payment_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub is_finalized: bool,
    pub finalized_at: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Invoice {
    pub fn payment_state(&self) -> PaymentState {
        PaymentState::from_string(&self.payment_state)
    }
}

/// Line item joining an invoice to one record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InvoiceRecord {
    pub invoice_id: Uuid,
    pub record_id: Uuid,
    pub line_item_price: Decimal,
    pub line_item_discount: Decimal,
    pub line_item_addition: Decimal,
    pub line_item_total: Decimal,
    pub created_utc: DateTime<Utc>,
}

/// A record on an invoice, with its line item and tests.
#[derive(Debug, Clone, Serialize)]
pub struct InvoicedRecord {
    pub line_item: InvoiceRecord,
    pub record: Record,
    pub tests: Vec<RecordTest>,
}

/// Invoice with embedded records, tests and payments.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDetails {
    pub invoice: Invoice,
    pub records: Vec<InvoicedRecord>,
    pub payments: Vec<Payment>,
}

/// Input for invoicing a batch of records.
#[derive(Debug, Clone, Validate)]
pub struct CreateInvoice {
    #[validate(length(min = 1))]
    pub record_ids: Vec<Uuid>,
    #[validate(custom(function = "validate_percentage"))]
    pub tax_rate: Decimal,
    #[validate(custom(function = "validate_non_negative"))]
    pub discount_amount: Decimal,
    #[validate(custom(function = "validate_non_negative"))]
    pub additional_charges: Decimal,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub notes: Option<String>,
}

/// Financial and descriptive edits that leave membership alone.
#[derive(Debug, Clone, Default, Validate)]
pub struct InvoiceAdjustment {
    #[validate(custom(function = "validate_percentage"))]
    pub tax_rate: Option<Decimal>,
    #[validate(custom(function = "validate_non_negative"))]
    pub discount_amount: Option<Decimal>,
    #[validate(custom(function = "validate_non_negative"))]
    pub additional_charges: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub payment_state: Option<PaymentState>,
}

impl InvoiceAdjustment {
    pub fn touches_amounts(&self) -> bool {
        self.tax_rate.is_some()
            || self.discount_amount.is_some()
            || self.additional_charges.is_some()
            || self.payment_state.is_some()
    }
}

/// The two mutually exclusive ways an invoice can be edited.
#[derive(Debug, Clone)]
pub enum InvoiceChange {
    /// Rebuild the line items from a new set of records.
    ReplaceRecords { record_ids: Vec<Uuid> },
    Adjust(InvoiceAdjustment),
}

/// Input for updating an invoice.
#[derive(Debug, Clone)]
pub struct UpdateInvoice {
    pub change: InvoiceChange,
    /// Permits editing an invoice that is already fully paid.
    pub allow_paid_override: bool,
}

/// Optional filter applied when listing invoices.
#[derive(Debug, Clone)]
pub enum InvoicePredicate {
    PaymentState(PaymentState),
    CustomerId(Uuid),
    OrdererId(Uuid),
    Finalized(bool),
    IssuedFrom(NaiveDate),
    IssuedTo(NaiveDate),
}
