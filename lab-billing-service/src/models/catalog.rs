//! Read-only catalog rows owned by the catalog service.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Orderable test with its current base price.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CatalogTest {
    pub test_id: Uuid,
    pub name: String,
    pub base_price: Decimal,
    pub active: bool,
    pub created_utc: DateTime<Utc>,
}

/// Test standard (method reference).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Standard {
    pub standard_id: Uuid,
    pub code: String,
    pub title: String,
    pub created_utc: DateTime<Utc>,
}
