//! Human-readable sequential numbers (`REC-2026-14`, `INV-2026-3`).
//!
//! Numbers are allocated by scanning the current maximum for the year and
//! incrementing it. Two concurrent writers can observe the same maximum; the
//! loser hits the unique constraint. Callers insert inside a savepoint and
//! retry a bounded number of times.

use service_core::error::AppError;
use sqlx::PgConnection;
use tracing::warn;

use crate::services::database::db_error;
use crate::services::metrics::NUMBER_RETRIES_TOTAL;

/// Default attempts before a collision is surfaced as a conflict.
pub const DEFAULT_ALLOCATION_ATTEMPTS: u32 = 3;

/// Numbered document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    Record,
    Invoice,
}

impl Sequence {
    pub fn prefix(&self) -> &'static str {
        match self {
            Sequence::Record => "REC",
            Sequence::Invoice => "INV",
        }
    }

    fn unique_constraint(&self) -> &'static str {
        match self {
            Sequence::Record => "records_record_number_key",
            Sequence::Invoice => "invoices_invoice_number_key",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Sequence::Record => "record",
            Sequence::Invoice => "invoice",
        }
    }
}

/// `PREFIX-<year>-<n>`.
pub fn format_number(sequence: Sequence, year: i32, n: i64) -> String {
    format!("{}-{}-{}", sequence.prefix(), year, n)
}

/// Next free number for `year` as seen by this connection.
pub async fn next_number(
    conn: &mut PgConnection,
    sequence: Sequence,
    year: i32,
) -> Result<String, AppError> {
    let pattern = format!("{}-{}-%", sequence.prefix(), year);

    let query = match sequence {
        Sequence::Record => {
            r#"
            SELECT COALESCE(MAX(CAST(split_part(record_number, '-', 3) AS BIGINT)), 0)
            FROM records
            WHERE record_number LIKE $1
            "#
        }
        Sequence::Invoice => {
            r#"
            SELECT COALESCE(MAX(CAST(split_part(invoice_number, '-', 3) AS BIGINT)), 0)
            FROM invoices
            WHERE invoice_number LIKE $1
            "#
        }
    };

    let current: i64 = sqlx::query_scalar(query)
        .bind(&pattern)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to scan sequence numbers"))?;

    Ok(format_number(sequence, year, current + 1))
}

/// Whether `err` is a lost race on this sequence's unique number.
pub fn is_collision(err: &sqlx::Error, sequence: Sequence) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation()
                && db_err.constraint() == Some(sequence.unique_constraint())
        }
        _ => false,
    }
}

/// Log and count a retried collision.
pub fn note_retry(sequence: Sequence, attempt: u32, number: &str) {
    NUMBER_RETRIES_TOTAL
        .with_label_values(&[sequence.label()])
        .inc();
    warn!(
        sequence = sequence.label(),
        attempt = attempt,
        number = %number,
        "Sequence number taken by a concurrent writer, retrying"
    );
}

/// Error for an insert that failed after the allocation loop gave up or
/// failed for another reason.
pub fn insert_error(err: sqlx::Error, sequence: Sequence, attempts: u32) -> AppError {
    if is_collision(&err, sequence) {
        return AppError::Conflict(anyhow::anyhow!(
            "Could not allocate a {} number after {} attempts, retry the request",
            sequence.label(),
            attempts
        ));
    }
    AppError::DatabaseError(anyhow::anyhow!(
        "Failed to insert {}: {}",
        sequence.label(),
        err
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_prefixed_per_year() {
        assert_eq!(format_number(Sequence::Invoice, 2026, 7), "INV-2026-7");
        assert_eq!(format_number(Sequence::Record, 2026, 12), "REC-2026-12");
    }

    #[test]
    fn collision_detection_ignores_other_errors() {
        assert!(!is_collision(&sqlx::Error::RowNotFound, Sequence::Invoice));
        assert!(matches!(
            insert_error(sqlx::Error::RowNotFound, Sequence::Record, 3),
            AppError::DatabaseError(_)
        ));
    }
}
