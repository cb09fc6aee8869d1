//! Row-level helpers shared by the invoice builder, payment ledger and
//! recalculation engine. All of them run on the caller's transaction.

use std::collections::HashSet;

use service_core::error::AppError;
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

use crate::models::{Invoice, RecordState};
use crate::services::database::db_error;
use crate::services::totals::{InvoiceTotals, Settlement};

pub(crate) const INVOICE_COLUMNS: &str = r#"
    invoice_id, invoice_number, customer_id, orderer_id, issue_date, due_date,
    subtotal, tax_rate, tax_amount, discount_amount, invoice_additional_charges,
    total_amount, amount_paid, amount_remaining, payment_state, payment_date,
    notes, is_finalized, finalized_at, created_utc, updated_utc
"#;

/// Load an invoice holding its row lock until the transaction ends.
pub(crate) async fn lock_invoice(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<Invoice, AppError> {
    let sql = format!(
        "SELECT {} FROM invoices WHERE invoice_id = $1 FOR UPDATE",
        INVOICE_COLUMNS
    );
    sqlx::query_as::<_, Invoice>(&sql)
        .bind(invoice_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to lock invoice"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))
}

pub(crate) async fn find_invoice(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<Option<Invoice>, AppError> {
    let sql = format!("SELECT {} FROM invoices WHERE invoice_id = $1", INVOICE_COLUMNS);
    sqlx::query_as::<_, Invoice>(&sql)
        .bind(invoice_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to get invoice"))
}

/// Lock records in id order, returning the ids that exist. Records are
/// always locked before the invoice row.
pub(crate) async fn lock_records(
    conn: &mut PgConnection,
    record_ids: &[Uuid],
) -> Result<Vec<Uuid>, AppError> {
    if record_ids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_scalar(
        "SELECT record_id FROM records WHERE record_id = ANY($1) ORDER BY record_id FOR UPDATE",
    )
    .bind(record_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to lock records"))
}

/// Records currently on `invoice_id`.
pub(crate) async fn member_ids(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<Vec<Uuid>, AppError> {
    sqlx::query_scalar(
        "SELECT record_id FROM invoice_records WHERE invoice_id = $1 ORDER BY record_id",
    )
    .bind(invoice_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load invoice members"))
}

/// A record as seen by invoicing: its parties and aggregated test prices.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct BillableRecord {
    pub record_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub orderer_id: Option<Uuid>,
    pub test_count: i64,
    pub price_sum: rust_decimal::Decimal,
    pub discount_sum: rust_decimal::Decimal,
    pub addition_sum: rust_decimal::Decimal,
    pub final_sum: rust_decimal::Decimal,
    pub invoice_id: Option<Uuid>,
}

/// Ids must be non-empty and distinct.
pub(crate) fn check_record_ids(record_ids: &[Uuid]) -> Result<(), AppError> {
    if record_ids.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "An invoice needs at least one record"
        )));
    }
    let mut seen = HashSet::with_capacity(record_ids.len());
    for id in record_ids {
        if !seen.insert(id) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Record {} is listed more than once",
                id
            )));
        }
    }
    Ok(())
}

/// Lock `record_ids` in id order and load them for invoicing.
///
/// Records already on `current_invoice` are accepted; records on any other
/// invoice are a conflict.
pub(crate) async fn load_billable(
    conn: &mut PgConnection,
    record_ids: &[Uuid],
    current_invoice: Option<Uuid>,
) -> Result<Vec<BillableRecord>, AppError> {
    check_record_ids(record_ids)?;

    let mut sorted = record_ids.to_vec();
    sorted.sort();

    let locked = lock_records(conn, &sorted).await?;
    if let Some(missing) = sorted.iter().find(|id| !locked.contains(id)) {
        return Err(AppError::NotFound(anyhow::anyhow!(
            "Record {} not found",
            missing
        )));
    }

    let rows = sqlx::query_as::<_, BillableRecord>(
        r#"
        SELECT r.record_id, s.customer_id, s.orderer_id,
               COUNT(rt.record_test_id) AS test_count,
               COALESCE(SUM(rt.test_price), 0) AS price_sum,
               COALESCE(SUM(rt.discount), 0) AS discount_sum,
               COALESCE(SUM(rt.additional_charges), 0) AS addition_sum,
               COALESCE(SUM(rt.final_price), 0) AS final_sum,
               ir.invoice_id
        FROM records r
        JOIN samples s ON s.sample_id = r.sample_id
        LEFT JOIN record_tests rt ON rt.record_id = r.record_id
        LEFT JOIN invoice_records ir ON ir.record_id = r.record_id
        WHERE r.record_id = ANY($1)
        GROUP BY r.record_id, s.customer_id, s.orderer_id, ir.invoice_id
        ORDER BY r.record_id
        "#,
    )
    .bind(&sorted)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load records for invoicing"))?;

    for row in &rows {
        if row.test_count == 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Record {} has no tests to bill",
                row.record_id
            )));
        }
        if let Some(owner) = row.invoice_id {
            if Some(owner) != current_invoice {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Record {} is already on invoice {}",
                    row.record_id,
                    owner
                )));
            }
        }
    }

    Ok(rows)
}

/// The customer and orderer every record agrees on.
///
/// At most one distinct customer and one distinct orderer may appear, and at
/// least one of the two must be known.
pub(crate) fn resolve_parties(
    records: &[BillableRecord],
) -> Result<(Option<Uuid>, Option<Uuid>), AppError> {
    let customers: HashSet<Uuid> = records.iter().filter_map(|r| r.customer_id).collect();
    let orderers: HashSet<Uuid> = records.iter().filter_map(|r| r.orderer_id).collect();

    if customers.len() > 1 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Records belong to {} different customers",
            customers.len()
        )));
    }
    if orderers.len() > 1 {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Records belong to {} different orderers",
            orderers.len()
        )));
    }

    let customer = customers.into_iter().next();
    let orderer = orderers.into_iter().next();
    if customer.is_none() && orderer.is_none() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Records have neither a customer nor an orderer"
        )));
    }
    Ok((customer, orderer))
}

pub(crate) async fn insert_line_items(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    records: &[BillableRecord],
) -> Result<(), AppError> {
    for record in records {
        sqlx::query(
            r#"
            INSERT INTO invoice_records
                (invoice_id, record_id, line_item_price, line_item_discount, line_item_addition,
                 line_item_total)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(invoice_id)
        .bind(record.record_id)
        .bind(record.price_sum)
        .bind(record.discount_sum)
        .bind(record.addition_sum)
        .bind(record.final_sum)
        .execute(&mut *conn)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Record {} is already invoiced",
                    record.record_id
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to insert line item: {}", e)),
        })?;
    }
    Ok(())
}

pub(crate) async fn set_records_state(
    conn: &mut PgConnection,
    record_ids: &[Uuid],
    state: RecordState,
) -> Result<(), AppError> {
    if record_ids.is_empty() {
        return Ok(());
    }
    sqlx::query("UPDATE records SET state = $2, updated_utc = NOW() WHERE record_id = ANY($1)")
        .bind(record_ids)
        .bind(state.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to update record states"))?;
    Ok(())
}

/// Refresh every line item of `invoice_id` from its records' current tests
/// and return the new subtotal.
pub(crate) async fn refresh_line_items(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<rust_decimal::Decimal, AppError> {
    sqlx::query(
        r#"
        UPDATE invoice_records ir SET
            line_item_price = COALESCE((
                SELECT SUM(rt.test_price) FROM record_tests rt WHERE rt.record_id = ir.record_id
            ), 0),
            line_item_discount = COALESCE((
                SELECT SUM(rt.discount) FROM record_tests rt WHERE rt.record_id = ir.record_id
            ), 0),
            line_item_addition = COALESCE((
                SELECT SUM(rt.additional_charges) FROM record_tests rt
                WHERE rt.record_id = ir.record_id
            ), 0),
            line_item_total = COALESCE((
                SELECT SUM(rt.final_price) FROM record_tests rt WHERE rt.record_id = ir.record_id
            ), 0)
        WHERE ir.invoice_id = $1
        "#,
    )
    .bind(invoice_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to refresh line items"))?;

    sqlx::query_scalar(
        "SELECT COALESCE(SUM(line_item_total), 0) FROM invoice_records WHERE invoice_id = $1",
    )
    .bind(invoice_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to sum line items"))
}

/// Reject totals the money columns cannot hold.
pub(crate) fn ensure_fits(totals: &InvoiceTotals) -> Result<(), AppError> {
    if !totals.fits_columns() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Invoice amounts exceed the supported range (total {})",
            totals.total_amount
        )));
    }
    Ok(())
}

/// Persist totals and settlement in one statement so the row CHECKs hold.
pub(crate) async fn store_amounts(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    totals: &InvoiceTotals,
    settlement: &Settlement,
) -> Result<Invoice, AppError> {
    ensure_fits(totals)?;
    let sql = format!(
        r#"
        UPDATE invoices SET
            subtotal = $2, tax_rate = $3, tax_amount = $4, discount_amount = $5,
            invoice_additional_charges = $6, total_amount = $7, amount_paid = $8,
            amount_remaining = $9, payment_state = $10, payment_date = $11,
            updated_utc = NOW()
        WHERE invoice_id = $1
        RETURNING {}
        "#,
        INVOICE_COLUMNS
    );
    sqlx::query_as::<_, Invoice>(&sql)
        .bind(invoice_id)
        .bind(totals.subtotal)
        .bind(totals.tax_rate)
        .bind(totals.tax_amount)
        .bind(totals.discount_amount)
        .bind(totals.additional_charges)
        .bind(totals.total_amount)
        .bind(settlement.amount_paid)
        .bind(settlement.amount_remaining)
        .bind(settlement.payment_state.as_str())
        .bind(settlement.payment_date)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to store invoice amounts"))
}

/// Persist a new settlement, leaving totals as they are.
pub(crate) async fn store_settlement(
    conn: &mut PgConnection,
    invoice_id: Uuid,
    settlement: &Settlement,
) -> Result<Invoice, AppError> {
    let sql = format!(
        r#"
        UPDATE invoices SET
            amount_paid = $2, amount_remaining = $3, payment_state = $4,
            payment_date = $5, updated_utc = NOW()
        WHERE invoice_id = $1
        RETURNING {}
        "#,
        INVOICE_COLUMNS
    );
    sqlx::query_as::<_, Invoice>(&sql)
        .bind(invoice_id)
        .bind(settlement.amount_paid)
        .bind(settlement.amount_remaining)
        .bind(settlement.payment_state.as_str())
        .bind(settlement.payment_date)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to store settlement"))
}

/// Totals of `invoice` recomputed for a new subtotal, keeping its rate,
/// discount, charges and paid amount.
pub(crate) fn rederive(
    invoice: &Invoice,
    subtotal: rust_decimal::Decimal,
    today: chrono::NaiveDate,
) -> (InvoiceTotals, Settlement) {
    let totals = InvoiceTotals::compute(
        subtotal,
        invoice.tax_rate,
        invoice.discount_amount,
        invoice.invoice_additional_charges,
    );
    let settlement = Settlement::derive(
        totals.total_amount,
        invoice.amount_paid,
        invoice.payment_state(),
        invoice.payment_date,
        today,
    );
    (totals, settlement)
}
