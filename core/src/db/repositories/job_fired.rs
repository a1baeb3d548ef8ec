// Firing record queries

use super::queries::job_fired_queries::{SELECT_ALL_COLUMNS, SELECT_ALL_COLUMNS_QUALIFIED};
use super::PgStoreTransaction;
use crate::db::store::JobFiredStore;
use crate::errors::DatabaseError;
use crate::models::{now_timestamp, FiredStatus, JobFired, JobFiredInsert, JobFiredUpdate};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

fn job_fired_from_row(row: &PgRow) -> Result<JobFired, DatabaseError> {
    let status: String = row.try_get("status")?;

    Ok(JobFired {
        id: row.try_get("id")?,
        job_detail_id: row.try_get("job_detail_id")?,
        fired_time: row.try_get("fired_time")?,
        status: status.parse().map_err(DatabaseError::InvalidValue)?,
        created_time: row.try_get("created_time")?,
        updated_time: row.try_get("updated_time")?,
    })
}

#[async_trait]
impl JobFiredStore for PgStoreTransaction {
    #[instrument(skip(self, fired), fields(job_detail_id = fired.job_detail_id))]
    async fn create_job_fired(&mut self, fired: JobFiredInsert) -> Result<JobFired, DatabaseError> {
        let now = now_timestamp();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_fired (job_detail_id, fired_time, status, created_time, updated_time)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING {}
            "#,
            SELECT_ALL_COLUMNS
        ))
        .bind(fired.job_detail_id)
        .bind(fired.fired_time)
        .bind(fired.status.to_string())
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;

        job_fired_from_row(&row)
    }

    #[instrument(skip(self, update))]
    async fn update_job_fired(
        &mut self,
        id: i64,
        update: JobFiredUpdate,
    ) -> Result<JobFired, DatabaseError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_fired
            SET status = COALESCE($2, status),
                fired_time = COALESCE($3, fired_time),
                updated_time = $4
            WHERE id = $1
            RETURNING {}
            "#,
            SELECT_ALL_COLUMNS
        ))
        .bind(id)
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.fired_time)
        .bind(now_timestamp())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("job_fired {}", id)))?;

        job_fired_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_job_fired(&mut self, id: i64) -> Result<Option<JobFired>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM job_fired WHERE id = $1",
            SELECT_ALL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(job_fired_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_one_job_fired_by_status(
        &mut self,
        status: FiredStatus,
    ) -> Result<Option<JobFired>, DatabaseError> {
        // LEFT JOIN so firings of purged definitions are still visited
        let row = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM job_fired f
            LEFT JOIN job_detail d ON d.id = f.job_detail_id
            WHERE f.status = $1
            ORDER BY f.fired_time ASC, COALESCE(d.priority, 0) ASC, f.id ASC
            LIMIT 1
            FOR UPDATE OF f
            "#,
            SELECT_ALL_COLUMNS_QUALIFIED
        ))
        .bind(status.to_string())
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(job_fired_from_row).transpose()
    }
}
