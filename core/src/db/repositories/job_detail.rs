// Job definition queries

use super::queries::job_detail_queries::SELECT_ALL_COLUMNS;
use super::PgStoreTransaction;
use crate::db::store::JobDetailStore;
use crate::errors::DatabaseError;
use crate::models::{
    now_timestamp, JobDetail, JobDetailFilter, JobDetailInsert, JobDetailOrder, JobDetailUpdate,
    JobStatus, Timestamp,
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::instrument;

pub(crate) fn job_detail_from_row(row: &PgRow) -> Result<JobDetail, DatabaseError> {
    let status: String = row.try_get("status")?;
    let misfire_policy: String = row.try_get("misfire_policy")?;

    Ok(JobDetail {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        pool: row.try_get("pool")?,
        source: row.try_get("source")?,
        class: row.try_get("class")?,
        args: row.try_get("args")?,
        priority: row.try_get("priority")?,
        expression: row.try_get("expression")?,
        next_fire_time: row.try_get("next_fire_time")?,
        pre_fire_time: row.try_get("pre_fire_time")?,
        misfire_threshold: row.try_get("misfire_threshold")?,
        misfire_policy: misfire_policy.parse().map_err(DatabaseError::InvalidValue)?,
        status: status.parse().map_err(DatabaseError::InvalidValue)?,
        deleted: row.try_get("deleted")?,
        deleted_time: row.try_get("deleted_time")?,
        created_time: row.try_get("created_time")?,
        updated_time: row.try_get("updated_time")?,
    })
}

#[async_trait]
impl JobDetailStore for PgStoreTransaction {
    #[instrument(skip(self, detail), fields(job_name = %detail.name, pool = %detail.pool))]
    async fn create_job_detail(
        &mut self,
        detail: JobDetailInsert,
    ) -> Result<JobDetail, DatabaseError> {
        let now = now_timestamp();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO job_detail (
                name, pool, source, class, args, priority, expression,
                next_fire_time, misfire_threshold, misfire_policy, status,
                deleted, created_time, updated_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, FALSE, $12, $12)
            RETURNING {}
            "#,
            SELECT_ALL_COLUMNS
        ))
        .bind(&detail.name)
        .bind(&detail.pool)
        .bind(&detail.source)
        .bind(&detail.class)
        .bind(&detail.args)
        .bind(detail.priority)
        .bind(&detail.expression)
        .bind(detail.next_fire_time)
        .bind(detail.misfire_threshold)
        .bind(detail.misfire_policy.to_string())
        .bind(JobStatus::Waiting.to_string())
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;

        let created = job_detail_from_row(&row)?;
        tracing::info!(job_detail_id = created.id, "Job detail created");
        Ok(created)
    }

    #[instrument(skip(self, update))]
    async fn update_job_detail(
        &mut self,
        id: i64,
        update: JobDetailUpdate,
    ) -> Result<JobDetail, DatabaseError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_detail
            SET status = COALESCE($2, status),
                next_fire_time = COALESCE($3, next_fire_time),
                pre_fire_time = COALESCE($4, pre_fire_time),
                deleted = COALESCE($5, deleted),
                deleted_time = COALESCE($6, deleted_time),
                updated_time = $7
            WHERE id = $1
            RETURNING {}
            "#,
            SELECT_ALL_COLUMNS
        ))
        .bind(id)
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.next_fire_time)
        .bind(update.pre_fire_time)
        .bind(update.deleted)
        .bind(update.deleted_time)
        .bind(now_timestamp())
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("job_detail {}", id)))?;

        job_detail_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_job_detail(&mut self, id: i64) -> Result<Option<JobDetail>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM job_detail WHERE id = $1",
            SELECT_ALL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(job_detail_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_job_detail_by_pool_and_name(
        &mut self,
        pool: &str,
        name: &str,
    ) -> Result<Option<JobDetail>, DatabaseError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM job_detail WHERE pool = $1 AND name = $2 AND deleted = FALSE",
            SELECT_ALL_COLUMNS
        ))
        .bind(pool)
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(job_detail_from_row).transpose()
    }

    #[instrument(skip(self, filter))]
    async fn search_job_details(
        &mut self,
        filter: &JobDetailFilter,
        order: JobDetailOrder,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobDetail>, DatabaseError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM job_detail WHERE 1 = 1",
            SELECT_ALL_COLUMNS
        ));

        if let Some(deleted) = filter.deleted {
            builder.push(" AND deleted = ").push_bind(deleted);
        }
        if let Some(before) = filter.deleted_before {
            builder.push(" AND deleted_time < ").push_bind(before);
        }
        if let Some(pool) = &filter.pool {
            builder.push(" AND pool = ").push_bind(pool.clone());
        }
        if let Some(name) = &filter.name {
            builder.push(" AND name = ").push_bind(name.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.to_string());
        }

        builder.push(match order {
            JobDetailOrder::IdAsc => " ORDER BY id ASC",
            JobDetailOrder::IdDesc => " ORDER BY id DESC",
            JobDetailOrder::NextFireTimeAsc => " ORDER BY next_fire_time ASC, id ASC",
            JobDetailOrder::DeletedTimeAsc => " ORDER BY deleted_time ASC, id ASC",
        });
        builder.push(" OFFSET ").push_bind(offset.max(0));
        builder.push(" LIMIT ").push_bind(limit.max(0));

        let rows = builder.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(job_detail_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn delete_job_detail(&mut self, id: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM job_detail WHERE id = $1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("job_detail {}", id)));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_due_waiting_job_details(
        &mut self,
        before: Timestamp,
    ) -> Result<Vec<JobDetail>, DatabaseError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM job_detail
            WHERE status = $1
              AND deleted = FALSE
              AND next_fire_time <= $2
            ORDER BY priority ASC, next_fire_time ASC, id ASC
            FOR UPDATE
            "#,
            SELECT_ALL_COLUMNS
        ))
        .bind(JobStatus::Waiting.to_string())
        .bind(before)
        .fetch_all(&mut *self.tx)
        .await?;

        tracing::debug!(count = rows.len(), "Found due waiting job details");
        rows.iter().map(job_detail_from_row).collect()
    }
}
