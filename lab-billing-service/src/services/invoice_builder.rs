//! Invoice builder: turns completed records into invoices and maintains them
//! until they are finalized.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    CreateInvoice, Invoice, InvoiceAdjustment, InvoiceChange, InvoiceDetails, InvoicePredicate,
    InvoiceRecord, InvoicedRecord, PageRequest, PaymentState, RecordState, UpdateInvoice,
};
use crate::services::database::{commit, db_error, Database};
use crate::services::finalization::ensure_invoice_unlocked;
use crate::services::invoice_rows::{
    check_record_ids, ensure_fits, find_invoice, insert_line_items, load_billable, lock_invoice,
    lock_records, member_ids, rederive, resolve_parties, set_records_state, store_amounts,
    INVOICE_COLUMNS,
};
use crate::services::metrics::{DB_QUERY_DURATION, INVOICES_TOTAL};
use crate::services::numbering::{insert_error, is_collision, next_number, note_retry, Sequence};
use crate::services::payment_ledger::payments_of_invoice;
use crate::services::record_store::{records_by_ids, tests_of_records};
use crate::services::totals::{InvoiceTotals, Settlement};

const LINE_ITEM_COLUMNS: &str = r#"
    invoice_id, record_id, line_item_price, line_item_discount, line_item_addition,
    line_item_total, created_utc
"#;

pub struct InvoiceBuilder {
    db: Arc<Database>,
    number_attempts: u32,
}

impl InvoiceBuilder {
    pub fn new(db: Arc<Database>, number_attempts: u32) -> Self {
        Self {
            db,
            number_attempts: number_attempts.max(1),
        }
    }

    /// Invoice a batch of records belonging to the same customer/orderer.
    ///
    /// The number's year is the year the invoice is created, not its
    /// `issue_date`, so back-dated invoices continue the current sequence.
    #[instrument(skip(self, input), fields(records = input.record_ids.len()))]
    pub async fn create_invoice(&self, input: &CreateInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        input.validate()?;
        check_record_ids(&input.record_ids)?;

        let mut tx = self.db.begin().await?;

        let records = load_billable(&mut tx, &input.record_ids, None).await?;
        let (customer_id, orderer_id) = resolve_parties(&records)?;

        let today = Utc::now().date_naive();
        let subtotal: Decimal = records.iter().map(|r| r.final_sum).sum();
        let totals = InvoiceTotals::compute(
            subtotal,
            input.tax_rate,
            input.discount_amount,
            input.additional_charges,
        );
        ensure_fits(&totals)?;
        let settlement = Settlement::opening(totals.total_amount);
        let issue_date = input.issue_date.unwrap_or(today);

        let invoice_id = Uuid::new_v4();
        let mut attempt = 0;
        let invoice = loop {
            attempt += 1;
            let number = next_number(&mut tx, Sequence::Invoice, today.year()).await?;

            let mut savepoint = Connection::begin(&mut *tx)
                .await
                .map_err(db_error("Failed to open savepoint"))?;
            let inserted = sqlx::query_as::<_, Invoice>(&format!(
                r#"
                INSERT INTO invoices
                    (invoice_id, invoice_number, customer_id, orderer_id, issue_date, due_date,
                     subtotal, tax_rate, tax_amount, discount_amount, invoice_additional_charges,
                     total_amount, amount_paid, amount_remaining, payment_state, notes)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                RETURNING {}
                "#,
                INVOICE_COLUMNS
            ))
            .bind(invoice_id)
            .bind(&number)
            .bind(customer_id)
            .bind(orderer_id)
            .bind(issue_date)
            .bind(input.due_date)
            .bind(totals.subtotal)
            .bind(totals.tax_rate)
            .bind(totals.tax_amount)
            .bind(totals.discount_amount)
            .bind(totals.additional_charges)
            .bind(totals.total_amount)
            .bind(settlement.amount_paid)
            .bind(settlement.amount_remaining)
            .bind(settlement.payment_state.as_str())
            .bind(&input.notes)
            .fetch_one(&mut *savepoint)
            .await;

            match inserted {
                Ok(invoice) => {
                    commit(savepoint).await?;
                    break invoice;
                }
                Err(e) if is_collision(&e, Sequence::Invoice) && attempt < self.number_attempts => {
                    savepoint
                        .rollback()
                        .await
                        .map_err(db_error("Failed to roll back savepoint"))?;
                    note_retry(Sequence::Invoice, attempt, &number);
                }
                Err(e) => return Err(insert_error(e, Sequence::Invoice, attempt)),
            }
        };

        insert_line_items(&mut tx, invoice_id, &records).await?;
        set_records_state(&mut tx, &input.record_ids, RecordState::Invoiced).await?;

        commit(tx).await?;
        timer.observe_duration();

        INVOICES_TOTAL.with_label_values(&["created"]).inc();
        if invoice.total_amount < Decimal::ZERO {
            warn!(
                invoice_id = %invoice_id,
                total_amount = %invoice.total_amount,
                "Invoice created with a negative total"
            );
        }
        info!(
            invoice_id = %invoice_id,
            invoice_number = %invoice.invoice_number,
            total_amount = %invoice.total_amount,
            "Invoice created"
        );

        Ok(invoice)
    }

    /// Replace the invoice's records or adjust its amounts.
    #[instrument(skip(self, input), fields(invoice_id = %invoice_id))]
    pub async fn update_invoice(
        &self,
        invoice_id: Uuid,
        input: &UpdateInvoice,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice"])
            .start_timer();

        let mut tx = self.db.begin().await?;

        let invoice = match &input.change {
            InvoiceChange::ReplaceRecords { record_ids } => {
                check_record_ids(record_ids)?;

                let mut involved = member_ids(&mut tx, invoice_id).await?;
                involved.extend(record_ids.iter().copied());
                involved.sort();
                involved.dedup();
                lock_records(&mut tx, &involved).await?;

                let invoice = lock_invoice(&mut tx, invoice_id).await?;
                check_editable(&invoice, input.allow_paid_override)?;

                replace_records(&mut tx, &invoice, record_ids).await?
            }
            InvoiceChange::Adjust(adjustment) => {
                adjustment.validate()?;

                let invoice = lock_invoice(&mut tx, invoice_id).await?;
                check_editable(&invoice, input.allow_paid_override)?;

                adjust(&mut tx, &invoice, adjustment).await?
            }
        };

        commit(tx).await?;
        timer.observe_duration();

        INVOICES_TOTAL.with_label_values(&["updated"]).inc();
        info!(
            invoice_id = %invoice_id,
            total_amount = %invoice.total_amount,
            payment_state = %invoice.payment_state,
            "Invoice updated"
        );

        Ok(invoice)
    }

    /// Issue the invoice. Irreversible; finalizing twice returns the invoice
    /// unchanged.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn finalize_invoice(&self, invoice_id: Uuid) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_invoice"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        let invoice = lock_invoice(&mut tx, invoice_id).await?;
        if invoice.is_finalized {
            return Ok(invoice);
        }

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices SET is_finalized = TRUE, finalized_at = NOW(), updated_utc = NOW()
            WHERE invoice_id = $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to finalize invoice"))?;

        commit(tx).await?;
        timer.observe_duration();

        INVOICES_TOTAL.with_label_values(&["finalized"]).inc();
        info!(
            invoice_id = %invoice_id,
            invoice_number = %invoice.invoice_number,
            "Invoice finalized"
        );

        Ok(invoice)
    }

    /// Delete an unpaid draft invoice and return its records to `completed`.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn delete_invoice(&self, invoice_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_invoice"])
            .start_timer();

        let mut tx = self.db.begin().await?;

        let members = member_ids(&mut tx, invoice_id).await?;
        lock_records(&mut tx, &members).await?;
        let invoice = lock_invoice(&mut tx, invoice_id).await?;

        if invoice.is_finalized {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} is finalized and cannot be deleted",
                invoice.invoice_number
            )));
        }
        if invoice.amount_paid > Decimal::ZERO {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} has payments and cannot be deleted",
                invoice.invoice_number
            )));
        }

        let members = member_ids(&mut tx, invoice_id).await?;

        sqlx::query("DELETE FROM invoices WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to delete invoice"))?;
        set_records_state(&mut tx, &members, RecordState::Completed).await?;

        commit(tx).await?;
        timer.observe_duration();

        INVOICES_TOTAL.with_label_values(&["deleted"]).inc();
        info!(
            invoice_id = %invoice_id,
            invoice_number = %invoice.invoice_number,
            released_records = members.len(),
            "Invoice deleted"
        );

        Ok(())
    }

    /// Invoice with its records, their tests and its payments, read from one
    /// snapshot.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn get_invoice_by_id(
        &self,
        invoice_id: Uuid,
    ) -> Result<Option<InvoiceDetails>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice_by_id"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to set snapshot isolation"))?;

        let Some(invoice) = find_invoice(&mut tx, invoice_id).await? else {
            return Ok(None);
        };

        let line_items = sqlx::query_as::<_, InvoiceRecord>(&format!(
            "SELECT {} FROM invoice_records WHERE invoice_id = $1 ORDER BY created_utc, record_id",
            LINE_ITEM_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_error("Failed to load line items"))?;

        let record_ids: Vec<Uuid> = line_items.iter().map(|l| l.record_id).collect();
        let mut records: HashMap<Uuid, _> = records_by_ids(&mut tx, &record_ids)
            .await?
            .into_iter()
            .map(|r| (r.record_id, r))
            .collect();
        let mut tests: HashMap<Uuid, Vec<_>> = HashMap::new();
        for test in tests_of_records(&mut tx, &record_ids).await? {
            tests.entry(test.record_id).or_default().push(test);
        }

        let mut embedded = Vec::with_capacity(line_items.len());
        for line_item in line_items {
            let record = records.remove(&line_item.record_id).ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Line item references missing record {}",
                    line_item.record_id
                ))
            })?;
            let tests = tests.remove(&line_item.record_id).unwrap_or_default();
            embedded.push(InvoicedRecord {
                line_item,
                record,
                tests,
            });
        }

        let payments = payments_of_invoice(&mut tx, invoice_id).await?;
        commit(tx).await?;
        timer.observe_duration();

        Ok(Some(InvoiceDetails {
            invoice,
            records: embedded,
            payments,
        }))
    }

    /// Invoices matching every predicate, ordered by id.
    #[instrument(skip(self, predicates), fields(predicates = predicates.len()))]
    pub async fn list_invoices(
        &self,
        predicates: &[InvoicePredicate],
        page: PageRequest,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices"])
            .start_timer();

        let mut query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM invoices WHERE TRUE",
            INVOICE_COLUMNS
        ));

        for predicate in predicates {
            match predicate {
                InvoicePredicate::PaymentState(state) => {
                    query.push(" AND payment_state = ").push_bind(state.as_str());
                }
                InvoicePredicate::CustomerId(id) => {
                    query.push(" AND customer_id = ").push_bind(*id);
                }
                InvoicePredicate::OrdererId(id) => {
                    query.push(" AND orderer_id = ").push_bind(*id);
                }
                InvoicePredicate::Finalized(finalized) => {
                    query.push(" AND is_finalized = ").push_bind(*finalized);
                }
                InvoicePredicate::IssuedFrom(from) => {
                    query.push(" AND issue_date >= ").push_bind(*from);
                }
                InvoicePredicate::IssuedTo(to) => {
                    query.push(" AND issue_date <= ").push_bind(*to);
                }
            }
        }

        if let Some(cursor) = page.page_token {
            query.push(" AND invoice_id > ").push_bind(cursor);
        }
        query.push(" ORDER BY invoice_id LIMIT ").push_bind(page.limit());

        let invoices = query
            .build_query_as::<Invoice>()
            .fetch_all(self.db.pool())
            .await
            .map_err(db_error("Failed to list invoices"))?;

        timer.observe_duration();

        Ok(invoices)
    }
}

fn check_editable(invoice: &Invoice, allow_paid_override: bool) -> Result<(), AppError> {
    ensure_invoice_unlocked(invoice, "invoice")?;
    if invoice.payment_state() == PaymentState::Paid && !allow_paid_override {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Invoice {} is paid; editing it requires an explicit override",
            invoice.invoice_number
        )));
    }
    Ok(())
}

/// Rebuild line items from `record_ids`. Records dropped from the invoice
/// go back to `completed`.
async fn replace_records(
    conn: &mut PgConnection,
    invoice: &Invoice,
    record_ids: &[Uuid],
) -> Result<Invoice, AppError> {
    let previous = member_ids(conn, invoice.invoice_id).await?;
    let records = load_billable(conn, record_ids, Some(invoice.invoice_id)).await?;
    let (customer_id, orderer_id) = resolve_parties(&records)?;

    sqlx::query("DELETE FROM invoice_records WHERE invoice_id = $1")
        .bind(invoice.invoice_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to clear line items"))?;
    insert_line_items(conn, invoice.invoice_id, &records).await?;

    let dropped: Vec<Uuid> = previous
        .into_iter()
        .filter(|id| !record_ids.contains(id))
        .collect();
    set_records_state(conn, &dropped, RecordState::Completed).await?;
    set_records_state(conn, record_ids, RecordState::Invoiced).await?;

    sqlx::query(
        r#"
        UPDATE invoices SET customer_id = $2, orderer_id = $3, updated_utc = NOW()
        WHERE invoice_id = $1
        "#,
    )
    .bind(invoice.invoice_id)
    .bind(customer_id)
    .bind(orderer_id)
    .execute(&mut *conn)
    .await
    .map_err(db_error("Failed to update invoice parties"))?;

    let subtotal: Decimal = records.iter().map(|r| r.final_sum).sum();
    let (totals, settlement) = rederive(invoice, subtotal, Utc::now().date_naive());
    let updated = store_amounts(conn, invoice.invoice_id, &totals, &settlement).await?;

    info!(
        invoice_id = %invoice.invoice_id,
        records = records.len(),
        released_records = dropped.len(),
        "Invoice records replaced"
    );

    Ok(updated)
}

/// Apply descriptive and financial edits. Only `cancelled` and `overdue`
/// stick as payment state overrides; any other requested state is
/// re-derived from the amounts.
async fn adjust(
    conn: &mut PgConnection,
    invoice: &Invoice,
    adjustment: &InvoiceAdjustment,
) -> Result<Invoice, AppError> {
    let sql = format!(
        r#"
        UPDATE invoices SET
            issue_date = COALESCE($2, issue_date),
            due_date = COALESCE($3, due_date),
            notes = COALESCE($4, notes),
            updated_utc = NOW()
        WHERE invoice_id = $1
        RETURNING {}
        "#,
        INVOICE_COLUMNS
    );
    let updated = sqlx::query_as::<_, Invoice>(&sql)
        .bind(invoice.invoice_id)
        .bind(adjustment.issue_date)
        .bind(adjustment.due_date)
        .bind(&adjustment.notes)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to update invoice"))?;

    if !adjustment.touches_amounts() {
        return Ok(updated);
    }

    let totals = InvoiceTotals::compute(
        invoice.subtotal,
        adjustment.tax_rate.unwrap_or(invoice.tax_rate),
        adjustment.discount_amount.unwrap_or(invoice.discount_amount),
        adjustment
            .additional_charges
            .unwrap_or(invoice.invoice_additional_charges),
    );
    let settlement = Settlement::derive(
        totals.total_amount,
        invoice.amount_paid,
        adjustment.payment_state.unwrap_or(invoice.payment_state()),
        invoice.payment_date,
        Utc::now().date_naive(),
    );

    if totals.total_amount < Decimal::ZERO {
        warn!(
            invoice_id = %invoice.invoice_id,
            total_amount = %totals.total_amount,
            "Invoice total is negative after adjustment"
        );
    }

    store_amounts(conn, invoice.invoice_id, &totals, &settlement).await
}
