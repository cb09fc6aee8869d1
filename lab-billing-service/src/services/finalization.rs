//! Finalization gate.
//!
//! Once an invoice is finalized nothing reachable from it may change: its
//! records, their tests, its payments. Every mutating operation calls into
//! this module inside its own transaction, so the check and the write see the
//! same row versions.

use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::warn;
use uuid::Uuid;

use crate::models::Invoice;
use crate::services::database::db_error;
use crate::services::metrics::LOCK_REJECTIONS_TOTAL;

fn locked(entity: &'static str, invoice_id: Uuid) -> AppError {
    LOCK_REJECTIONS_TOTAL.with_label_values(&[entity]).inc();
    warn!(entity = entity, invoice_id = %invoice_id, "Mutation rejected by finalized invoice");
    AppError::Locked(anyhow::anyhow!(
        "Invoice {} is finalized and can no longer be modified",
        invoice_id
    ))
}

/// Owning record of a record test.
pub async fn record_of_test(
    conn: &mut PgConnection,
    record_test_id: Uuid,
) -> Result<Uuid, AppError> {
    sqlx::query_scalar::<_, Uuid>("SELECT record_id FROM record_tests WHERE record_test_id = $1")
        .bind(record_test_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to resolve record test"))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Record test {} not found", record_test_id))
        })
}

/// Lock `record_id` and the invoice it belongs to, if any.
///
/// Returns the invoice id when the record is invoiced. Fails with `Locked`
/// when that invoice is finalized and `NotFound` when the record is absent.
pub async fn guard_record(
    conn: &mut PgConnection,
    record_id: Uuid,
    entity: &'static str,
) -> Result<Option<Uuid>, AppError> {
    let exists = sqlx::query_scalar::<_, Uuid>(
        "SELECT record_id FROM records WHERE record_id = $1 FOR UPDATE",
    )
    .bind(record_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to lock record"))?;

    if exists.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Record {} not found",
            record_id
        )));
    }

    let owner = sqlx::query_as::<_, (Uuid, bool)>(
        r#"
        SELECT i.invoice_id, i.is_finalized
        FROM invoice_records ir
        JOIN invoices i ON i.invoice_id = ir.invoice_id
        WHERE ir.record_id = $1
        FOR UPDATE OF i
        "#,
    )
    .bind(record_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to lock owning invoice"))?;

    match owner {
        Some((invoice_id, true)) => Err(locked(entity, invoice_id)),
        Some((invoice_id, false)) => Ok(Some(invoice_id)),
        None => Ok(None),
    }
}

/// Guard for operations on an invoice row the caller already locked.
pub fn ensure_invoice_unlocked(invoice: &Invoice, entity: &'static str) -> Result<(), AppError> {
    if invoice.is_finalized {
        return Err(locked(entity, invoice.invoice_id));
    }
    Ok(())
}
