//! Payment ledger: money received against invoices.
//!
//! Adding a payment adjusts `amount_paid` incrementally. Edits and deletes
//! re-sum every payment of the invoice instead, so drift can never build up;
//! both paths go through `Settlement::derive` and end in the same state.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::models::{CreatePayment, Invoice, Payment, PaymentState, UpdatePayment};
use crate::services::database::{commit, db_error, Database};
use crate::services::finalization::ensure_invoice_unlocked;
use crate::services::images::{cleanup_images, dropped_urls, ImageStore};
use crate::services::invoice_rows::{find_invoice, lock_invoice, store_settlement};
use crate::services::metrics::{DB_QUERY_DURATION, PAYMENTS_TOTAL, PAYMENT_AMOUNT_TOTAL};
use crate::services::totals::{money, Settlement};

const PAYMENT_COLUMNS: &str = r#"
    payment_id, invoice_id, amount, payment_method, reference, image_urls,
    payment_date, notes, created_utc, updated_utc
"#;

pub struct PaymentLedger {
    db: Arc<Database>,
    images: Arc<dyn ImageStore>,
}

impl PaymentLedger {
    pub fn new(db: Arc<Database>, images: Arc<dyn ImageStore>) -> Self {
        Self { db, images }
    }

    /// Record a payment of at most the invoice's remaining balance.
    #[instrument(skip(self, input), fields(invoice_id = %input.invoice_id, amount = %input.amount))]
    pub async fn add_payment(&self, input: &CreatePayment) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_payment"])
            .start_timer();

        input.validate()?;
        check_method(&input.payment_method)?;
        let amount = money(input.amount);

        let mut tx = self.db.begin().await?;
        let invoice = lock_invoice(&mut tx, input.invoice_id).await?;

        if invoice.payment_state() == PaymentState::Cancelled {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is cancelled and does not accept payments",
                invoice.invoice_number
            )));
        }
        if amount > invoice.amount_remaining {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Payment of {} exceeds the remaining balance of {} on invoice {}",
                amount,
                invoice.amount_remaining,
                invoice.invoice_number
            )));
        }

        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments
                (payment_id, invoice_id, amount, payment_method, reference, image_urls,
                 payment_date, notes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.invoice_id)
        .bind(amount)
        .bind(input.payment_method.trim())
        .bind(&input.reference)
        .bind(&input.image_urls)
        .bind(input.payment_date)
        .bind(&input.notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to insert payment"))?;

        let settlement = Settlement::derive(
            invoice.total_amount,
            invoice.amount_paid + amount,
            invoice.payment_state(),
            invoice.payment_date,
            Utc::now().date_naive(),
        );
        let invoice = store_settlement(&mut tx, invoice.invoice_id, &settlement).await?;

        commit(tx).await?;
        timer.observe_duration();

        PAYMENTS_TOTAL
            .with_label_values(&[method_label(&payment.payment_method)])
            .inc();
        PAYMENT_AMOUNT_TOTAL.inc_by(amount.to_f64().unwrap_or_default());
        info!(
            payment_id = %payment.payment_id,
            invoice_id = %invoice.invoice_id,
            amount_remaining = %invoice.amount_remaining,
            payment_state = %invoice.payment_state,
            "Payment added"
        );

        Ok(payment)
    }

    /// Edit a payment and re-derive the invoice settlement from all payments.
    #[instrument(skip(self, changes), fields(payment_id = %payment_id))]
    pub async fn update_payment(
        &self,
        payment_id: Uuid,
        changes: &UpdatePayment,
    ) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_payment"])
            .start_timer();

        changes.validate()?;
        if let Some(method) = &changes.payment_method {
            check_method(method)?;
        }

        let mut tx = self.db.begin().await?;
        let invoice_id = invoice_of_payment(&mut tx, payment_id).await?;
        let invoice = lock_invoice(&mut tx, invoice_id).await?;
        ensure_invoice_unlocked(&invoice, "payment")?;

        let current = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE payment_id = $1 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to load payment"))?;

        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            UPDATE payments SET
                amount = COALESCE($2, amount),
                payment_method = COALESCE($3, payment_method),
                reference = COALESCE($4, reference),
                image_urls = COALESCE($5, image_urls),
                payment_date = COALESCE($6, payment_date),
                notes = COALESCE($7, notes),
                updated_utc = NOW()
            WHERE payment_id = $1
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .bind(changes.amount.map(money))
        .bind(changes.payment_method.as_deref().map(str::trim))
        .bind(&changes.reference)
        .bind(&changes.image_urls)
        .bind(changes.payment_date)
        .bind(&changes.notes)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to update payment"))?;

        let invoice = resettle(&mut tx, &invoice, true).await?;

        commit(tx).await?;
        timer.observe_duration();

        info!(
            payment_id = %payment_id,
            invoice_id = %invoice.invoice_id,
            amount_paid = %invoice.amount_paid,
            payment_state = %invoice.payment_state,
            "Payment updated"
        );

        let released = dropped_urls(&current.image_urls, &payment.image_urls);
        cleanup_images(self.images.as_ref(), &released).await;

        Ok(payment)
    }

    /// Delete a payment and re-derive the invoice settlement.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn delete_payment(&self, payment_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_payment"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        let invoice_id = invoice_of_payment(&mut tx, payment_id).await?;
        let invoice = lock_invoice(&mut tx, invoice_id).await?;
        ensure_invoice_unlocked(&invoice, "payment")?;

        let images: Vec<String> =
            sqlx::query_scalar("DELETE FROM payments WHERE payment_id = $1 RETURNING image_urls")
                .bind(payment_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_error("Failed to delete payment"))?;

        let invoice = resettle(&mut tx, &invoice, false).await?;

        commit(tx).await?;
        timer.observe_duration();

        info!(
            payment_id = %payment_id,
            invoice_id = %invoice.invoice_id,
            amount_paid = %invoice.amount_paid,
            payment_state = %invoice.payment_state,
            "Payment deleted"
        );

        cleanup_images(self.images.as_ref(), &images).await;

        Ok(())
    }

    /// Payments of an invoice, oldest first.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn list_payments_by_invoice(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments_by_invoice"])
            .start_timer();

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;

        if find_invoice(&mut conn, invoice_id).await?.is_none() {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice {} not found",
                invoice_id
            )));
        }
        let payments = payments_of_invoice(&mut conn, invoice_id).await?;

        timer.observe_duration();

        Ok(payments)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE payment_id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(db_error("Failed to get payment"))
    }
}

fn check_method(method: &str) -> Result<(), AppError> {
    if method.trim().is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Payment method must not be blank"
        )));
    }
    Ok(())
}

/// Metric label for a free-form payment method. Unknown methods share one
/// label.
fn method_label(method: &str) -> &'static str {
    match method.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
        "cash" => "cash",
        "card" | "credit_card" | "debit_card" => "card",
        "bank_transfer" | "transfer" | "wire" => "bank_transfer",
        "cheque" | "check" => "cheque",
        _ => "other",
    }
}

async fn invoice_of_payment(conn: &mut PgConnection, payment_id: Uuid) -> Result<Uuid, AppError> {
    sqlx::query_scalar::<_, Uuid>("SELECT invoice_id FROM payments WHERE payment_id = $1")
        .bind(payment_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to resolve payment"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))
}

/// Re-sum all payments of a locked invoice and store the settlement.
async fn resettle(
    conn: &mut PgConnection,
    invoice: &Invoice,
    reject_overpayment: bool,
) -> Result<Invoice, AppError> {
    let paid: Decimal =
        sqlx::query_scalar("SELECT COALESCE(SUM(amount), 0) FROM payments WHERE invoice_id = $1")
            .bind(invoice.invoice_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error("Failed to sum payments"))?;

    if reject_overpayment && paid > invoice.total_amount {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Payments of {} would exceed the invoice total of {}",
            paid,
            invoice.total_amount
        )));
    }

    let settlement = Settlement::derive(
        invoice.total_amount,
        paid,
        invoice.payment_state(),
        invoice.payment_date,
        Utc::now().date_naive(),
    );
    store_settlement(conn, invoice.invoice_id, &settlement).await
}

pub(crate) async fn payments_of_invoice(
    conn: &mut PgConnection,
    invoice_id: Uuid,
) -> Result<Vec<Payment>, AppError> {
    sqlx::query_as::<_, Payment>(&format!(
        r#"
        SELECT {}
        FROM payments
        WHERE invoice_id = $1
        ORDER BY payment_date, created_utc, payment_id
        "#,
        PAYMENT_COLUMNS
    ))
    .bind(invoice_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to list payments"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_labels_are_bounded() {
        assert_eq!(method_label("Cash"), "cash");
        assert_eq!(method_label(" bank transfer "), "bank_transfer");
        assert_eq!(method_label("Credit-Card"), "card");
        assert_eq!(method_label("cheque"), "cheque");
        assert_eq!(method_label("voucher #4411"), "other");
        assert_eq!(method_label(&"x".repeat(500)), "other");
    }
}
