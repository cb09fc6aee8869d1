//! In-transaction notifications for record test changes.
//!
//! The record store publishes an event for every test it adds, edits or
//! removes. Listeners receive the open transaction's connection, so whatever
//! they write commits or rolls back together with the change itself.

use std::sync::Arc;

use async_trait::async_trait;
use service_core::error::AppError;
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordTestChange {
    Added,
    Updated,
    Removed,
}

impl RecordTestChange {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordTestChange::Added => "record_test_added",
            RecordTestChange::Updated => "record_test_updated",
            RecordTestChange::Removed => "record_test_removed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordTestEvent {
    pub change: RecordTestChange,
    pub record_id: Uuid,
    pub record_test_id: Uuid,
    /// Invoice the record belongs to, already locked by the publisher.
    pub invoice_id: Option<Uuid>,
}

#[async_trait]
pub trait RecordTestListener: Send + Sync {
    async fn on_record_test_changed(
        &self,
        conn: &mut PgConnection,
        event: &RecordTestEvent,
    ) -> Result<(), AppError>;
}

/// Fan-out to registered listeners, in subscription order.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn RecordTestListener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn RecordTestListener>) {
        self.listeners.push(listener);
    }

    /// Stops at the first listener error; the caller's transaction is then
    /// dropped and everything rolls back.
    pub async fn dispatch(
        &self,
        conn: &mut PgConnection,
        event: &RecordTestEvent,
    ) -> Result<(), AppError> {
        for listener in &self.listeners {
            listener.on_record_test_changed(&mut *conn, event).await?;
        }
        Ok(())
    }
}
