//! Record (lab work order) model for lab-billing-service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{NewRecordTest, NewSample, RecordTest, Sample};

/// Record lifecycle state.
///
/// The nominal flow is `received → in_laboratory → testing → completed →
/// invoiced → delivered`; staff may override it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Received,
    InLaboratory,
    Testing,
    Completed,
    Invoiced,
    Delivered,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Received => "received",
            RecordState::InLaboratory => "in_laboratory",
            RecordState::Testing => "testing",
            RecordState::Completed => "completed",
            RecordState::Invoiced => "invoiced",
            RecordState::Delivered => "delivered",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "in_laboratory" => RecordState::InLaboratory,
            "testing" => RecordState::Testing,
            "completed" => RecordState::Completed,
            "invoiced" => RecordState::Invoiced,
            "delivered" => RecordState::Delivered,
            _ => RecordState::Received,
        }
    }

    /// Completed and invoiced work orders carry billing history.
    pub fn is_deletable(&self) -> bool {
        !matches!(self, RecordState::Completed | RecordState::Invoiced)
    }
}

/// Who is editing a record's tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditSource {
    Reception,
    Laboratory,
}

/// Lab work order derived from a sample.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Record {
    pub record_id: Uuid,
    pub sample_id: Uuid,
    pub record_number: String,
    pub state: String,
    pub modified_by_lab: Option<bool>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Record {
    pub fn state(&self) -> RecordState {
        RecordState::from_string(&self.state)
    }
}

/// Record together with its sample and tests.
#[derive(Debug, Clone, Serialize)]
pub struct RecordDetails {
    pub record: Record,
    pub sample: Sample,
    pub tests: Vec<RecordTest>,
}

/// Input for receiving a sample and opening its work order.
#[derive(Debug, Clone)]
pub struct CreateRecord {
    pub sample: NewSample,
    pub tests: Vec<NewRecordTest>,
}

/// Optional filter applied when listing records.
#[derive(Debug, Clone)]
pub enum RecordPredicate {
    State(RecordState),
    CustomerId(Uuid),
    OrdererId(Uuid),
    SampleId(Uuid),
    CreatedFrom(DateTime<Utc>),
    CreatedTo(DateTime<Utc>),
}
