// Audit log persistence

use crate::db::store::JobLogSink;
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::JobLog;
use async_trait::async_trait;
use tracing::instrument;

/// Appends audit entries to the job_log table
#[derive(Debug, Clone)]
pub struct PgJobLogRepository {
    pool: DbPool,
}

impl PgJobLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLogSink for PgJobLogRepository {
    #[instrument(skip(self, log), fields(job_detail_id = log.job_detail_id, status = %log.status))]
    async fn append(&self, log: JobLog) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO job_log (
                job_detail_id, job_fired_id, name, pool, source, class,
                args, priority, status, message, hostname, created_time
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(log.job_detail_id)
        .bind(log.job_fired_id)
        .bind(&log.name)
        .bind(&log.pool)
        .bind(&log.source)
        .bind(&log.class)
        .bind(&log.args)
        .bind(log.priority)
        .bind(&log.status)
        .bind(&log.message)
        .bind(&log.hostname)
        .bind(log.created_time)
        .execute(self.pool.pool())
        .await?;

        Ok(())
    }
}
