//! Record store: samples, their work orders and the tests ordered on them.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    CatalogTest, CreateRecord, EditSource, NewRecordTest, PageRequest, Record, RecordDetails,
    RecordPredicate, RecordState, RecordTest, Sample, UpdateRecordTest, UpdateSample,
};
use crate::services::catalog::{require_standard, require_test};
use crate::services::database::{commit, db_error, Database};
use crate::services::events::{EventDispatcher, RecordTestChange, RecordTestEvent};
use crate::services::finalization::{guard_record, record_of_test};
use crate::services::images::{cleanup_images, dropped_urls, ImageStore};
use crate::services::metrics::{DB_QUERY_DURATION, RECORDS_TOTAL};
use crate::services::numbering::{insert_error, is_collision, next_number, note_retry, Sequence};
use crate::services::totals::{final_price, fits_money_column, money};

const RECORD_COLUMNS: &str =
    "record_id, sample_id, record_number, state, modified_by_lab, created_utc, updated_utc";

const RECORD_TEST_COLUMNS: &str = r#"
    record_test_id, record_id, test_id, standard_id, test_price, additional_charges,
    discount, final_price, state, notes, created_utc, updated_utc
"#;

const SAMPLE_COLUMNS: &str = r#"
    sample_id, customer_id, orderer_id, sample_name, quantity, condition,
    reception_notes, reception_date, image_urls, created_utc, updated_utc
"#;

pub struct RecordStore {
    db: Arc<Database>,
    events: EventDispatcher,
    images: Arc<dyn ImageStore>,
    number_attempts: u32,
}

impl RecordStore {
    pub fn new(
        db: Arc<Database>,
        events: EventDispatcher,
        images: Arc<dyn ImageStore>,
        number_attempts: u32,
    ) -> Self {
        Self {
            db,
            events,
            images,
            number_attempts: number_attempts.max(1),
        }
    }

    /// Receive a sample and open its work order with the requested tests.
    #[instrument(skip(self, input), fields(tests = input.tests.len()))]
    pub async fn create_record(&self, input: &CreateRecord) -> Result<RecordDetails, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_record"])
            .start_timer();

        input.sample.validate()?;
        for test in &input.tests {
            test.validate()?;
        }
        if input.sample.customer_id.is_none() && input.sample.orderer_id.is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "A sample needs a customer or an orderer"
            )));
        }
        if input.tests.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "A record needs at least one test"
            )));
        }

        let mut tx = self.db.begin().await?;

        let mut priced = Vec::with_capacity(input.tests.len());
        for test in &input.tests {
            priced.push(price_new_test(&mut tx, test).await?);
        }

        let sample = sqlx::query_as::<_, Sample>(&format!(
            r#"
            INSERT INTO samples
                (sample_id, customer_id, orderer_id, sample_name, quantity, condition,
                 reception_notes, reception_date, image_urls)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            SAMPLE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.sample.customer_id)
        .bind(input.sample.orderer_id)
        .bind(&input.sample.sample_name)
        .bind(input.sample.quantity)
        .bind(&input.sample.condition)
        .bind(&input.sample.reception_notes)
        .bind(input.sample.reception_date)
        .bind(&input.sample.image_urls)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to create sample"))?;

        let year = Utc::now().year();
        let record_id = Uuid::new_v4();
        let mut attempt = 0;
        let record = loop {
            attempt += 1;
            let number = next_number(&mut tx, Sequence::Record, year).await?;

            let mut savepoint = Connection::begin(&mut *tx)
                .await
                .map_err(db_error("Failed to open savepoint"))?;
            let inserted = sqlx::query_as::<_, Record>(&format!(
                r#"
                INSERT INTO records (record_id, sample_id, record_number, state)
                VALUES ($1, $2, $3, $4)
                RETURNING {}
                "#,
                RECORD_COLUMNS
            ))
            .bind(record_id)
            .bind(sample.sample_id)
            .bind(&number)
            .bind(RecordState::Received.as_str())
            .fetch_one(&mut *savepoint)
            .await;

            match inserted {
                Ok(record) => {
                    commit(savepoint).await?;
                    break record;
                }
                Err(e) if is_collision(&e, Sequence::Record) && attempt < self.number_attempts => {
                    savepoint
                        .rollback()
                        .await
                        .map_err(db_error("Failed to roll back savepoint"))?;
                    note_retry(Sequence::Record, attempt, &number);
                }
                Err(e) => return Err(insert_error(e, Sequence::Record, attempt)),
            }
        };

        let mut tests = Vec::with_capacity(priced.len());
        for (catalog, test) in priced.iter().zip(&input.tests) {
            tests.push(insert_record_test(&mut tx, record.record_id, catalog, test).await?);
        }

        commit(tx).await?;
        timer.observe_duration();

        RECORDS_TOTAL.with_label_values(&["created"]).inc();
        info!(
            record_id = %record.record_id,
            record_number = %record.record_number,
            sample_id = %sample.sample_id,
            "Record created"
        );

        Ok(RecordDetails {
            record,
            sample,
            tests,
        })
    }

    /// Edit one test. Price inputs recompute `final_price` in the same write.
    #[instrument(skip(self, changes), fields(record_test_id = %record_test_id, source = ?source))]
    pub async fn update_record_test(
        &self,
        record_test_id: Uuid,
        changes: &UpdateRecordTest,
        source: EditSource,
    ) -> Result<RecordTest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_record_test"])
            .start_timer();

        changes.validate()?;

        let mut tx = self.db.begin().await?;
        let record_id = record_of_test(&mut tx, record_test_id).await?;
        let invoice_id = guard_record(&mut tx, record_id, "record_test").await?;

        let current = sqlx::query_as::<_, RecordTest>(&format!(
            "SELECT {} FROM record_tests WHERE record_test_id = $1 FOR UPDATE",
            RECORD_TEST_COLUMNS
        ))
        .bind(record_test_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to load record test"))?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Record test {} not found", record_test_id))
        })?;

        if let Some(standard_id) = changes.standard_id {
            require_standard(&mut tx, standard_id).await?;
        }

        let test_price = money(changes.test_price.unwrap_or(current.test_price));
        let additional_charges = money(
            changes
                .additional_charges
                .unwrap_or(current.additional_charges),
        );
        let discount = money(changes.discount.unwrap_or(current.discount));
        let final_price = if changes.touches_price() {
            final_price(test_price, additional_charges, discount)
        } else {
            current.final_price
        };
        if final_price < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Discount exceeds price for record test {}",
                record_test_id
            )));
        }
        if !fits_money_column(final_price) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Price of record test {} exceeds the supported range",
                record_test_id
            )));
        }

        let state = changes
            .state
            .map(|s| s.as_str().to_string())
            .unwrap_or(current.state);

        let updated = sqlx::query_as::<_, RecordTest>(&format!(
            r#"
            UPDATE record_tests SET
                standard_id = $2, test_price = $3, additional_charges = $4, discount = $5,
                final_price = $6, state = $7, notes = $8, updated_utc = NOW()
            WHERE record_test_id = $1
            RETURNING {}
            "#,
            RECORD_TEST_COLUMNS
        ))
        .bind(record_test_id)
        .bind(changes.standard_id.or(current.standard_id))
        .bind(test_price)
        .bind(additional_charges)
        .bind(discount)
        .bind(final_price)
        .bind(&state)
        .bind(changes.notes.as_ref().or(current.notes.as_ref()))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to update record test"))?;

        mark_edit_source(&mut tx, record_id, source).await?;
        self.events
            .dispatch(
                &mut tx,
                &RecordTestEvent {
                    change: RecordTestChange::Updated,
                    record_id,
                    record_test_id,
                    invoice_id,
                },
            )
            .await?;

        commit(tx).await?;
        timer.observe_duration();

        info!(
            record_test_id = %record_test_id,
            final_price = %updated.final_price,
            "Record test updated"
        );

        Ok(updated)
    }

    /// Order another test on an existing record.
    #[instrument(
        skip(self, test),
        fields(record_id = %record_id, test_id = %test.test_id, source = ?source)
    )]
    pub async fn add_test_to_record(
        &self,
        record_id: Uuid,
        test: &NewRecordTest,
        source: EditSource,
    ) -> Result<RecordTest, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_test_to_record"])
            .start_timer();

        test.validate()?;

        let mut tx = self.db.begin().await?;
        let invoice_id = guard_record(&mut tx, record_id, "record_test").await?;

        let catalog = price_new_test(&mut tx, test).await?;
        let created = insert_record_test(&mut tx, record_id, &catalog, test).await?;

        mark_edit_source(&mut tx, record_id, source).await?;
        self.events
            .dispatch(
                &mut tx,
                &RecordTestEvent {
                    change: RecordTestChange::Added,
                    record_id,
                    record_test_id: created.record_test_id,
                    invoice_id,
                },
            )
            .await?;

        commit(tx).await?;
        timer.observe_duration();

        info!(record_test_id = %created.record_test_id, "Test added to record");

        Ok(created)
    }

    /// Remove a test. A record may be left without tests.
    #[instrument(skip(self), fields(record_test_id = %record_test_id, source = ?source))]
    pub async fn remove_test_from_record(
        &self,
        record_test_id: Uuid,
        source: EditSource,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_test_from_record"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        let record_id = record_of_test(&mut tx, record_test_id).await?;
        let invoice_id = guard_record(&mut tx, record_id, "record_test").await?;

        sqlx::query("DELETE FROM record_tests WHERE record_test_id = $1")
            .bind(record_test_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to delete record test"))?;

        mark_edit_source(&mut tx, record_id, source).await?;
        self.events
            .dispatch(
                &mut tx,
                &RecordTestEvent {
                    change: RecordTestChange::Removed,
                    record_id,
                    record_test_id,
                    invoice_id,
                },
            )
            .await?;

        commit(tx).await?;
        timer.observe_duration();

        info!(record_test_id = %record_test_id, record_id = %record_id, "Test removed from record");

        Ok(())
    }

    /// Delete a record that never reached billing, and its sample once no
    /// other record uses it.
    #[instrument(skip(self), fields(record_id = %record_id))]
    pub async fn delete_record(&self, record_id: Uuid) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_record"])
            .start_timer();

        let mut tx = self.db.begin().await?;

        let record = sqlx::query_as::<_, Record>(&format!(
            "SELECT {} FROM records WHERE record_id = $1 FOR UPDATE",
            RECORD_COLUMNS
        ))
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock record"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Record {} not found", record_id)))?;

        if !record.state().is_deletable() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Record {} is {} and cannot be deleted",
                record.record_number,
                record.state
            )));
        }

        let invoiced: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM invoice_records WHERE record_id = $1)",
        )
        .bind(record_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to check invoice membership"))?;
        if invoiced {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Record {} is on an invoice and cannot be deleted",
                record.record_number
            )));
        }

        // Sample first, so a concurrent sibling delete cannot orphan it.
        sqlx::query("SELECT sample_id FROM samples WHERE sample_id = $1 FOR UPDATE")
            .bind(record.sample_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to lock sample"))?;

        sqlx::query("DELETE FROM records WHERE record_id = $1")
            .bind(record_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to delete record"))?;

        let orphaned_images: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM samples s
            WHERE s.sample_id = $1
              AND NOT EXISTS (SELECT 1 FROM records r WHERE r.sample_id = s.sample_id)
            RETURNING s.image_urls
            "#,
        )
        .bind(record.sample_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to delete sample"))?
        .unwrap_or_default();

        commit(tx).await?;
        timer.observe_duration();

        RECORDS_TOTAL.with_label_values(&["deleted"]).inc();
        info!(
            record_id = %record_id,
            record_number = %record.record_number,
            "Record deleted"
        );

        cleanup_images(self.images.as_ref(), &orphaned_images).await;

        Ok(())
    }

    /// Staff override of the lifecycle state. Any transition is accepted.
    #[instrument(skip(self), fields(record_id = %record_id, state = new_state.as_str()))]
    pub async fn update_record_state(
        &self,
        record_id: Uuid,
        new_state: RecordState,
    ) -> Result<Record, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_record_state"])
            .start_timer();

        let mut tx = self.db.begin().await?;
        guard_record(&mut tx, record_id, "record").await?;

        let record = sqlx::query_as::<_, Record>(&format!(
            "UPDATE records SET state = $2, updated_utc = NOW() WHERE record_id = $1 RETURNING {}",
            RECORD_COLUMNS
        ))
        .bind(record_id)
        .bind(new_state.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to update record state"))?;

        commit(tx).await?;
        timer.observe_duration();

        RECORDS_TOTAL.with_label_values(&["state_changed"]).inc();
        info!(record_id = %record_id, state = %record.state, "Record state changed");

        Ok(record)
    }

    /// Record with its sample and tests.
    #[instrument(skip(self), fields(record_id = %record_id))]
    pub async fn get_record(&self, record_id: Uuid) -> Result<Option<RecordDetails>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_record"])
            .start_timer();

        let mut conn = self
            .db
            .pool()
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;

        let Some(record) = sqlx::query_as::<_, Record>(&format!(
            "SELECT {} FROM records WHERE record_id = $1",
            RECORD_COLUMNS
        ))
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to get record"))?
        else {
            return Ok(None);
        };

        let sample = sqlx::query_as::<_, Sample>(&format!(
            "SELECT {} FROM samples WHERE sample_id = $1",
            SAMPLE_COLUMNS
        ))
        .bind(record.sample_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to get sample"))?;

        let tests = tests_of_records(&mut conn, &[record_id]).await?;

        timer.observe_duration();

        Ok(Some(RecordDetails {
            record,
            sample,
            tests,
        }))
    }

    /// Records matching every predicate, ordered by id.
    #[instrument(skip(self, predicates), fields(predicates = predicates.len()))]
    pub async fn list_records(
        &self,
        predicates: &[RecordPredicate],
        page: PageRequest,
    ) -> Result<Vec<Record>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_records"])
            .start_timer();

        let mut query = QueryBuilder::<Postgres>::new(
            r#"
            SELECT r.record_id, r.sample_id, r.record_number, r.state, r.modified_by_lab,
                   r.created_utc, r.updated_utc
            FROM records r
            JOIN samples s ON s.sample_id = r.sample_id
            WHERE TRUE
            "#,
        );

        for predicate in predicates {
            match predicate {
                RecordPredicate::State(state) => {
                    query.push(" AND r.state = ").push_bind(state.as_str());
                }
                RecordPredicate::CustomerId(id) => {
                    query.push(" AND s.customer_id = ").push_bind(*id);
                }
                RecordPredicate::OrdererId(id) => {
                    query.push(" AND s.orderer_id = ").push_bind(*id);
                }
                RecordPredicate::SampleId(id) => {
                    query.push(" AND r.sample_id = ").push_bind(*id);
                }
                RecordPredicate::CreatedFrom(from) => {
                    query.push(" AND r.created_utc >= ").push_bind(*from);
                }
                RecordPredicate::CreatedTo(to) => {
                    query.push(" AND r.created_utc < ").push_bind(*to);
                }
            }
        }

        if let Some(cursor) = page.page_token {
            query.push(" AND r.record_id > ").push_bind(cursor);
        }
        query.push(" ORDER BY r.record_id LIMIT ").push_bind(page.limit());

        let records = query
            .build_query_as::<Record>()
            .fetch_all(self.db.pool())
            .await
            .map_err(db_error("Failed to list records"))?;

        timer.observe_duration();

        Ok(records)
    }

    /// Edit reception metadata. Images no longer referenced are released
    /// after commit.
    #[instrument(skip(self, changes), fields(sample_id = %sample_id))]
    pub async fn update_sample(
        &self,
        sample_id: Uuid,
        changes: &UpdateSample,
    ) -> Result<Sample, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_sample"])
            .start_timer();

        changes.validate()?;

        let mut tx = self.db.begin().await?;

        let current = sqlx::query_as::<_, Sample>(&format!(
            "SELECT {} FROM samples WHERE sample_id = $1 FOR UPDATE",
            SAMPLE_COLUMNS
        ))
        .bind(sample_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock sample"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sample {} not found", sample_id)))?;

        let updated = sqlx::query_as::<_, Sample>(&format!(
            r#"
            UPDATE samples SET
                sample_name = COALESCE($2, sample_name),
                quantity = COALESCE($3, quantity),
                condition = COALESCE($4, condition),
                reception_notes = COALESCE($5, reception_notes),
                image_urls = COALESCE($6, image_urls),
                updated_utc = NOW()
            WHERE sample_id = $1
            RETURNING {}
            "#,
            SAMPLE_COLUMNS
        ))
        .bind(sample_id)
        .bind(&changes.sample_name)
        .bind(changes.quantity)
        .bind(&changes.condition)
        .bind(&changes.reception_notes)
        .bind(&changes.image_urls)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to update sample"))?;

        commit(tx).await?;
        timer.observe_duration();

        info!(sample_id = %sample_id, "Sample updated");

        let released = dropped_urls(&current.image_urls, &updated.image_urls);
        cleanup_images(self.images.as_ref(), &released).await;

        Ok(updated)
    }
}

/// Catalog entry for a requested test, checked against the requested
/// adjustments.
async fn price_new_test(
    conn: &mut PgConnection,
    test: &NewRecordTest,
) -> Result<CatalogTest, AppError> {
    let catalog = require_test(conn, test.test_id).await?;
    if let Some(standard_id) = test.standard_id {
        require_standard(conn, standard_id).await?;
    }
    let price = final_price(catalog.base_price, test.additional_charges, test.discount);
    if price < Decimal::ZERO {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Discount exceeds price for test {}",
            test.test_id
        )));
    }
    if !fits_money_column(price) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Price of test {} exceeds the supported range",
            test.test_id
        )));
    }
    Ok(catalog)
}

/// Insert a test, snapshotting the catalog price.
async fn insert_record_test(
    conn: &mut PgConnection,
    record_id: Uuid,
    catalog: &CatalogTest,
    test: &NewRecordTest,
) -> Result<RecordTest, AppError> {
    let test_price = money(catalog.base_price);
    let additional_charges = money(test.additional_charges);
    let discount = money(test.discount);

    sqlx::query_as::<_, RecordTest>(&format!(
        r#"
        INSERT INTO record_tests
            (record_test_id, record_id, test_id, standard_id, test_price, additional_charges,
             discount, final_price, notes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {}
        "#,
        RECORD_TEST_COLUMNS
    ))
    .bind(Uuid::new_v4())
    .bind(record_id)
    .bind(catalog.test_id)
    .bind(test.standard_id)
    .bind(test_price)
    .bind(additional_charges)
    .bind(discount)
    .bind(final_price(test_price, additional_charges, discount))
    .bind(&test.notes)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_error("Failed to insert record test"))
}

/// Laboratory edits raise the flag; reception edits only settle an unset
/// flag to false.
async fn mark_edit_source(
    conn: &mut PgConnection,
    record_id: Uuid,
    source: EditSource,
) -> Result<(), AppError> {
    let sql = match source {
        EditSource::Laboratory => {
            "UPDATE records SET modified_by_lab = TRUE, updated_utc = NOW() WHERE record_id = $1"
        }
        EditSource::Reception => {
            r#"
            UPDATE records
            SET modified_by_lab = COALESCE(modified_by_lab, FALSE), updated_utc = NOW()
            WHERE record_id = $1
            "#
        }
    };
    sqlx::query(sql)
        .bind(record_id)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to mark record edit"))?;
    Ok(())
}

/// Tests of the given records ordered by record then creation.
pub(crate) async fn tests_of_records(
    conn: &mut PgConnection,
    record_ids: &[Uuid],
) -> Result<Vec<RecordTest>, AppError> {
    sqlx::query_as::<_, RecordTest>(&format!(
        r#"
        SELECT {}
        FROM record_tests
        WHERE record_id = ANY($1)
        ORDER BY record_id, created_utc, record_test_id
        "#,
        RECORD_TEST_COLUMNS
    ))
    .bind(record_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load record tests"))
}

pub(crate) async fn records_by_ids(
    conn: &mut PgConnection,
    record_ids: &[Uuid],
) -> Result<Vec<Record>, AppError> {
    sqlx::query_as::<_, Record>(&format!(
        "SELECT {} FROM records WHERE record_id = ANY($1)",
        RECORD_COLUMNS
    ))
    .bind(record_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_error("Failed to load records"))
}
