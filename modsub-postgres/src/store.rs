//! Projection table adapter.

use async_trait::async_trait;
use modsub::store::{ProjectionError, ProjectionStore, SubscriptionRow};
use modsub::types::{ModId, SequenceNumber, UserId};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

/// `ProjectionStore` backed by the `subscription_projections` table.
#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: PgPool,
}

impl PostgresProjectionStore {
    /// Creates the adapter over an existing pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_error(err: &sqlx::Error) -> ProjectionError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() || db.is_check_violation() => {
            ProjectionError::Constraint(db.to_string())
        }
        _ => ProjectionError::Connection(err.to_string()),
    }
}

fn sequence_to_i64(sequence: SequenceNumber) -> Result<i64, ProjectionError> {
    i64::try_from(u64::from(sequence))
        .map_err(|_| ProjectionError::Constraint("sequence number exceeds BIGINT".to_string()))
}

#[async_trait]
impl ProjectionStore for PostgresProjectionStore {
    #[instrument(name = "projection.ensure_schema", skip(self))]
    async fn ensure_schema(&self) -> Result<(), ProjectionError> {
        sqlx::query(r#"CREATE EXTENSION IF NOT EXISTS "uuid-ossp""#)
            .execute(&self.pool)
            .await
            .map_err(|err| ProjectionError::Schema(err.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subscription_projections (
                mod_id        VARCHAR(255) NOT NULL,
                user_id       VARCHAR(50)  NOT NULL,
                last_event_id BIGINT       NOT NULL,
                created_at    TIMESTAMPTZ  NOT NULL DEFAULT now(),
                updated_at    TIMESTAMPTZ  NOT NULL DEFAULT now(),
                deleted_at    TIMESTAMPTZ,
                PRIMARY KEY (mod_id, user_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|err| ProjectionError::Schema(err.to_string()))?;

        debug!("projection schema is in place");
        Ok(())
    }

    #[instrument(name = "projection.upsert", skip(self), fields(user = %row.user_id, module = %row.mod_id))]
    async fn upsert(&self, row: SubscriptionRow) -> Result<(), ProjectionError> {
        let last_event_id = sequence_to_i64(row.last_event_id)?;

        sqlx::query(
            "INSERT INTO subscription_projections (mod_id, user_id, last_event_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (mod_id, user_id) DO UPDATE
             SET last_event_id = GREATEST(subscription_projections.last_event_id, EXCLUDED.last_event_id),
                 updated_at = now(),
                 deleted_at = NULL",
        )
        .bind(row.mod_id.as_ref())
        .bind(row.user_id.as_ref())
        .bind(last_event_id)
        .execute(&self.pool)
        .await
        .map_err(|err| storage_error(&err))?;

        Ok(())
    }

    #[instrument(name = "projection.delete", skip(self), fields(user = %user_id, module = %mod_id))]
    async fn delete_by_key(&self, user_id: &UserId, mod_id: &ModId) -> Result<(), ProjectionError> {
        // Soft delete; zero affected rows (absent key) is still success.
        sqlx::query(
            "UPDATE subscription_projections
             SET deleted_at = now(), updated_at = now()
             WHERE mod_id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(mod_id.as_ref())
        .bind(user_id.as_ref())
        .execute(&self.pool)
        .await
        .map_err(|err| storage_error(&err))?;

        Ok(())
    }

    #[instrument(name = "projection.query_by_user", skip(self), fields(user = %user_id))]
    async fn query_by_user(&self, user_id: &UserId) -> Result<Vec<SubscriptionRow>, ProjectionError> {
        let rows = sqlx::query(
            "SELECT mod_id, user_id, last_event_id
             FROM subscription_projections
             WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id.as_ref())
        .fetch_all(&self.pool)
        .await
        .map_err(|err| storage_error(&err))?;

        rows.into_iter()
            .map(|row| {
                let mod_id: String = row
                    .try_get("mod_id")
                    .map_err(|err| ProjectionError::Connection(err.to_string()))?;
                let user_id: String = row
                    .try_get("user_id")
                    .map_err(|err| ProjectionError::Connection(err.to_string()))?;
                let last_event_id: i64 = row
                    .try_get("last_event_id")
                    .map_err(|err| ProjectionError::Connection(err.to_string()))?;
                row_from_columns(&user_id, &mod_id, last_event_id)
            })
            .collect()
    }
}

/// Maps raw column values back into a projection row.
fn row_from_columns(
    user_id: &str,
    mod_id: &str,
    last_event_id: i64,
) -> Result<SubscriptionRow, ProjectionError> {
    let user_id = UserId::try_new(user_id)
        .map_err(|err| ProjectionError::Constraint(format!("stored user_id invalid: {err}")))?;
    let mod_id = ModId::try_new(mod_id)
        .map_err(|err| ProjectionError::Constraint(format!("stored mod_id invalid: {err}")))?;
    let last_event_id = u64::try_from(last_event_id)
        .ok()
        .and_then(|raw| SequenceNumber::try_new(raw).ok())
        .ok_or_else(|| {
            ProjectionError::Constraint(format!("stored last_event_id invalid: {last_event_id}"))
        })?;
    Ok(SubscriptionRow::new(user_id, mod_id, last_event_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_mapping_accepts_well_formed_rows() {
        let row = row_from_columns("u1", "m1", 42).unwrap();
        assert_eq!(row.user_id.as_ref(), "u1");
        assert_eq!(row.mod_id.as_ref(), "m1");
        assert_eq!(u64::from(row.last_event_id), 42);
    }

    #[test]
    fn column_mapping_rejects_corrupt_rows() {
        assert!(row_from_columns("", "m1", 1).is_err());
        assert!(row_from_columns("u1", "", 1).is_err());
        assert!(row_from_columns("u1", "m1", 0).is_err());
        assert!(row_from_columns("u1", "m1", -5).is_err());
    }
}
