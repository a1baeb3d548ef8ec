// PostgreSQL implementation of the scheduler stores
// One sqlx transaction backs both the job_detail and job_fired operations.

pub mod job_detail;
pub mod job_fired;
pub mod job_log;
mod queries;

pub use job_log::PgJobLogRepository;

use crate::db::store::{SchedulerStore, StoreTransaction};
use crate::db::DbPool;
use crate::errors::DatabaseError;
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use tracing::instrument;

/// Opens PostgreSQL transactions for the scheduler
#[derive(Debug, Clone)]
pub struct PgSchedulerStore {
    pool: DbPool,
}

impl PgSchedulerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchedulerStore for PgSchedulerStore {
    #[instrument(skip(self))]
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError> {
        let tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("begin: {}", e)))?;
        Ok(Box::new(PgStoreTransaction { tx }))
    }
}

/// A live PostgreSQL transaction
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgStoreTransaction { tx } = *self;
        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("commit: {}", e)))
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let PgStoreTransaction { tx } = *self;
        tx.rollback()
            .await
            .map_err(|e| DatabaseError::TransactionFailed(format!("rollback: {}", e)))
    }
}
