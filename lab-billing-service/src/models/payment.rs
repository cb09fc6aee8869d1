//! Payment model for lab-billing-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::{validate_image_urls, validate_positive};

/// A single money receipt against an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub payment_method: String,
    pub reference: Option<String>,
    pub image_urls: Vec<String>,
    pub payment_date: NaiveDate,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for recording a payment.
#[derive(Debug, Clone, Validate)]
pub struct CreatePayment {
    pub invoice_id: Uuid,
    #[validate(custom(function = "validate_positive"))]
    pub amount: Decimal,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    #[validate(length(max = 255))]
    pub reference: Option<String>,
    #[validate(custom(function = "validate_image_urls"))]
    pub image_urls: Vec<String>,
    pub payment_date: NaiveDate,
    pub notes: Option<String>,
}

/// Edits to a recorded payment.
#[derive(Debug, Clone, Default, Validate)]
pub struct UpdatePayment {
    #[validate(custom(function = "validate_positive"))]
    pub amount: Option<Decimal>,
    #[validate(length(min = 1, max = 50))]
    pub payment_method: Option<String>,
    #[validate(length(max = 255))]
    pub reference: Option<String>,
    #[validate(custom(function = "validate_image_urls"))]
    pub image_urls: Option<Vec<String>>,
    pub payment_date: Option<NaiveDate>,
    pub notes: Option<String>,
}
