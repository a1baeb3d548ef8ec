// Store contracts consumed by the scheduler service
//
// Every read and write goes through a `StoreTransaction`; the scheduler opens
// one per phase and either commits or rolls it back as a unit.

use crate::errors::DatabaseError;
use crate::models::{
    FiredStatus, JobDetail, JobDetailFilter, JobDetailInsert, JobDetailOrder, JobDetailUpdate,
    JobFired, JobFiredInsert, JobFiredUpdate, JobLog, Timestamp,
};
use async_trait::async_trait;

/// Job definition operations
#[async_trait]
pub trait JobDetailStore: Send {
    async fn create_job_detail(&mut self, detail: JobDetailInsert)
        -> Result<JobDetail, DatabaseError>;

    /// Apply a partial update and return the updated row
    async fn update_job_detail(
        &mut self,
        id: i64,
        update: JobDetailUpdate,
    ) -> Result<JobDetail, DatabaseError>;

    async fn get_job_detail(&mut self, id: i64) -> Result<Option<JobDetail>, DatabaseError>;

    /// Live (not soft-deleted) definition with the given pool and name
    async fn get_job_detail_by_pool_and_name(
        &mut self,
        pool: &str,
        name: &str,
    ) -> Result<Option<JobDetail>, DatabaseError>;

    async fn search_job_details(
        &mut self,
        filter: &JobDetailFilter,
        order: JobDetailOrder,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobDetail>, DatabaseError>;

    /// Hard delete
    async fn delete_job_detail(&mut self, id: i64) -> Result<(), DatabaseError>;

    /// Non-deleted `waiting` definitions with `next_fire_time <= before`,
    /// ordered by priority, then next fire time, then id
    async fn find_due_waiting_job_details(
        &mut self,
        before: Timestamp,
    ) -> Result<Vec<JobDetail>, DatabaseError>;
}

/// Firing record operations
#[async_trait]
pub trait JobFiredStore: Send {
    async fn create_job_fired(&mut self, fired: JobFiredInsert) -> Result<JobFired, DatabaseError>;

    async fn update_job_fired(
        &mut self,
        id: i64,
        update: JobFiredUpdate,
    ) -> Result<JobFired, DatabaseError>;

    async fn get_job_fired(&mut self, id: i64) -> Result<Option<JobFired>, DatabaseError>;

    /// Oldest firing with the given status (by fired time, then priority, then id)
    async fn get_one_job_fired_by_status(
        &mut self,
        status: FiredStatus,
    ) -> Result<Option<JobFired>, DatabaseError>;
}

/// A unit of work spanning both stores
#[async_trait]
pub trait StoreTransaction: JobDetailStore + JobFiredStore {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Entry point for opening transactions
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError>;
}

/// Append-only audit log destination
#[async_trait]
pub trait JobLogSink: Send + Sync {
    async fn append(&self, log: JobLog) -> Result<(), DatabaseError>;
}
