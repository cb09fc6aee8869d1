//! Read-only lookups against the test catalog.

use service_core::error::AppError;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::models::CatalogTest;
use crate::services::database::db_error;

pub async fn find_test(
    conn: &mut PgConnection,
    test_id: Uuid,
) -> Result<Option<CatalogTest>, AppError> {
    sqlx::query_as::<_, CatalogTest>(
        "SELECT test_id, name, base_price, active, created_utc FROM tests WHERE test_id = $1",
    )
    .bind(test_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_error("Failed to look up catalog test"))
}

pub async fn standard_exists(conn: &mut PgConnection, standard_id: Uuid) -> Result<bool, AppError> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM standards WHERE standard_id = $1)")
        .bind(standard_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error("Failed to look up standard"))
}

/// Catalog test that can be ordered, or a validation error naming it.
pub async fn require_test(conn: &mut PgConnection, test_id: Uuid) -> Result<CatalogTest, AppError> {
    match find_test(conn, test_id).await? {
        Some(test) if test.active => Ok(test),
        Some(_) => Err(AppError::BadRequest(anyhow::anyhow!(
            "Test {} is no longer offered",
            test_id
        ))),
        None => Err(AppError::BadRequest(anyhow::anyhow!(
            "Test {} does not exist",
            test_id
        ))),
    }
}

pub async fn require_standard(conn: &mut PgConnection, standard_id: Uuid) -> Result<(), AppError> {
    if !standard_exists(conn, standard_id).await? {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Standard {} does not exist",
            standard_id
        )));
    }
    Ok(())
}
