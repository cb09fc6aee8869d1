//! Recalculation engine: re-derives an invoice from its member tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::Invoice;
use crate::services::database::{commit, Database};
use crate::services::events::{RecordTestEvent, RecordTestListener};
use crate::services::finalization::ensure_invoice_unlocked;
use crate::services::invoice_rows::{lock_invoice, refresh_line_items, rederive, store_amounts};
use crate::services::metrics::{DB_QUERY_DURATION, RECALCULATIONS_TOTAL};

pub struct RecalculationEngine {
    db: Arc<Database>,
}

impl RecalculationEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Recompute line items, totals and settlement from current data.
    /// Running it twice yields the same invoice.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn recalculate_invoice_totals(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["recalculate_invoice_totals"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        let invoice = recalculate_in(&mut tx, invoice_id, "manual").await?;
        commit(tx).await?;

        timer.observe_duration();
        Ok(invoice)
    }
}

/// Recalculate on the caller's transaction.
pub(crate) async fn recalculate_in(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    trigger: &'static str,
) -> Result<Invoice, AppError> {
    let invoice = lock_invoice(conn, invoice_id).await?;
    ensure_invoice_unlocked(&invoice, "invoice")?;

    let subtotal = refresh_line_items(conn, invoice_id).await?;
    let (totals, settlement) = rederive(&invoice, subtotal, Utc::now().date_naive());

    if totals.total_amount < Decimal::ZERO {
        warn!(
            invoice_id = %invoice_id,
            total_amount = %totals.total_amount,
            "Invoice total is negative after recalculation"
        );
    }

    let updated = store_amounts(conn, invoice_id, &totals, &settlement).await?;

    RECALCULATIONS_TOTAL.with_label_values(&[trigger]).inc();
    info!(
        invoice_id = %invoice_id,
        trigger = trigger,
        subtotal = %updated.subtotal,
        total_amount = %updated.total_amount,
        amount_remaining = %updated.amount_remaining,
        "Invoice totals recalculated"
    );

    Ok(updated)
}

#[async_trait]
impl RecordTestListener for RecalculationEngine {
    async fn on_record_test_changed(
        &self,
        conn: &mut PgConnection,
        event: &RecordTestEvent,
    ) -> Result<(), AppError> {
        if let Some(invoice_id) = event.invoice_id {
            recalculate_in(conn, invoice_id, event.change.as_str()).await?;
        }
        Ok(())
    }
}
