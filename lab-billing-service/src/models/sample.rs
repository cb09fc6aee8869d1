//! Sample model for lab-billing-service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use super::validate_image_urls;

/// Physical item received at reception.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Sample {
    pub sample_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub orderer_id: Option<Uuid>,
    pub sample_name: String,
    pub quantity: i32,
    pub condition: Option<String>,
    pub reception_notes: Option<String>,
    pub reception_date: NaiveDate,
    pub image_urls: Vec<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Sample data captured at reception.
#[derive(Debug, Clone, Validate)]
pub struct NewSample {
    pub customer_id: Option<Uuid>,
    pub orderer_id: Option<Uuid>,
    #[validate(length(min = 1, max = 255))]
    pub sample_name: String,
    #[validate(range(min = 1))]
    pub quantity: i32,
    #[validate(length(max = 100))]
    pub condition: Option<String>,
    pub reception_notes: Option<String>,
    pub reception_date: NaiveDate,
    #[validate(custom(function = "validate_image_urls"))]
    pub image_urls: Vec<String>,
}

/// Reception metadata edits. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Validate)]
pub struct UpdateSample {
    #[validate(length(min = 1, max = 255))]
    pub sample_name: Option<String>,
    #[validate(range(min = 1))]
    pub quantity: Option<i32>,
    #[validate(length(max = 100))]
    pub condition: Option<String>,
    pub reception_notes: Option<String>,
    #[validate(custom(function = "validate_image_urls"))]
    pub image_urls: Option<Vec<String>>,
}
