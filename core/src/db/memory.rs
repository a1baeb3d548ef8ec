// In-memory store for single-node runs and tests
//
// Two isolation levels are offered. `Serializable` transactions hold the
// state mutex for their whole lifetime and work on a private copy.
// `ReadCommitted` transactions lock the state per statement only, so
// concurrent transactions interleave and each statement sees every commit
// made so far. Both buffer their writes until commit; rollback discards them.

use crate::db::store::{JobDetailStore, JobFiredStore, JobLogSink, SchedulerStore, StoreTransaction};
use crate::errors::DatabaseError;
use crate::models::{
    now_timestamp, FiredStatus, JobDetail, JobDetailFilter, JobDetailInsert, JobDetailOrder,
    JobDetailUpdate, JobFired, JobFiredInsert, JobFiredUpdate, JobLog, JobStatus, Timestamp,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    details: BTreeMap<i64, JobDetail>,
    fired: BTreeMap<i64, JobFired>,
    last_detail_id: i64,
    last_fired_id: i64,
}

/// Visibility between concurrent transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Isolation {
    /// One transaction at a time
    #[default]
    Serializable,
    /// Transactions run concurrently without row locks, like PostgreSQL's
    /// default level
    ReadCommitted,
}

/// Shared in-memory scheduler store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<AsyncMutex<MemoryState>>,
    isolation: Isolation,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_committed() -> Self {
        Self {
            isolation: Isolation::ReadCommitted,
            ..Self::default()
        }
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Snapshot of every job definition, soft-deleted ones included
    pub async fn job_details(&self) -> Vec<JobDetail> {
        self.state.lock().await.details.values().cloned().collect()
    }

    /// Snapshot of every firing record
    pub async fn job_fireds(&self) -> Vec<JobFired> {
        self.state.lock().await.fired.values().cloned().collect()
    }

    pub async fn job_fireds_for(&self, job_detail_id: i64) -> Vec<JobFired> {
        self.state
            .lock()
            .await
            .fired
            .values()
            .filter(|f| f.job_detail_id == job_detail_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, DatabaseError> {
        let tx = match self.isolation {
            Isolation::Serializable => {
                let guard = self.state.clone().lock_owned().await;
                let working = guard.clone();
                MemoryTransaction {
                    access: Access::Exclusive(guard),
                    working,
                    writes: PendingWrites::default(),
                }
            }
            Isolation::ReadCommitted => MemoryTransaction {
                access: Access::Shared(self.state.clone()),
                working: MemoryState::default(),
                writes: PendingWrites::default(),
            },
        };
        Ok(Box::new(tx))
    }
}

enum Access {
    Exclusive(OwnedMutexGuard<MemoryState>),
    Shared(Arc<AsyncMutex<MemoryState>>),
}

/// Rows written by a transaction; `None` marks a hard delete
#[derive(Default)]
struct PendingWrites {
    details: BTreeMap<i64, Option<JobDetail>>,
    fired: BTreeMap<i64, JobFired>,
}

impl PendingWrites {
    fn apply_to(&self, state: &mut MemoryState) {
        for (id, detail) in &self.details {
            match detail {
                Some(detail) => {
                    state.details.insert(*id, detail.clone());
                }
                None => {
                    state.details.remove(id);
                }
            }
        }
        for (id, fired) in &self.fired {
            state.fired.insert(*id, fired.clone());
        }
    }
}

pub struct MemoryTransaction {
    access: Access,
    /// What the current statement reads: committed rows plus own writes
    working: MemoryState,
    writes: PendingWrites,
}

impl MemoryTransaction {
    /// Start a statement; under read committed this picks up new commits
    async fn refresh(&mut self) {
        if let Access::Shared(state) = &self.access {
            let mut view = state.lock().await.clone();
            self.writes.apply_to(&mut view);
            self.working = view;
        }
    }

    /// Under read committed ids behave like sequences and are never handed
    /// out twice, even across a rollback
    async fn next_detail_id(&mut self) -> i64 {
        match &self.access {
            Access::Exclusive(_) => {
                self.working.last_detail_id += 1;
                self.working.last_detail_id
            }
            Access::Shared(state) => {
                let mut state = state.lock().await;
                state.last_detail_id += 1;
                state.last_detail_id
            }
        }
    }

    async fn next_fired_id(&mut self) -> i64 {
        match &self.access {
            Access::Exclusive(_) => {
                self.working.last_fired_id += 1;
                self.working.last_fired_id
            }
            Access::Shared(state) => {
                let mut state = state.lock().await;
                state.last_fired_id += 1;
                state.last_fired_id
            }
        }
    }

    fn put_detail(&mut self, detail: JobDetail) {
        self.working.details.insert(detail.id, detail.clone());
        self.writes.details.insert(detail.id, Some(detail));
    }

    fn put_fired(&mut self, fired: JobFired) {
        self.working.fired.insert(fired.id, fired.clone());
        self.writes.fired.insert(fired.id, fired);
    }
}

#[async_trait]
impl JobDetailStore for MemoryTransaction {
    async fn create_job_detail(
        &mut self,
        detail: JobDetailInsert,
    ) -> Result<JobDetail, DatabaseError> {
        self.refresh().await;
        let duplicate = self
            .working
            .details
            .values()
            .any(|d| !d.deleted && d.pool == detail.pool && d.name == detail.name);
        if duplicate {
            return Err(DatabaseError::DuplicateKey(format!(
                "job_detail ({}, {})",
                detail.pool, detail.name
            )));
        }

        let now = now_timestamp();
        let created = JobDetail {
            id: self.next_detail_id().await,
            name: detail.name,
            pool: detail.pool,
            source: detail.source,
            class: detail.class,
            args: detail.args,
            priority: detail.priority,
            expression: detail.expression,
            next_fire_time: detail.next_fire_time,
            pre_fire_time: None,
            misfire_threshold: detail.misfire_threshold,
            misfire_policy: detail.misfire_policy,
            status: JobStatus::Waiting,
            deleted: false,
            deleted_time: None,
            created_time: now,
            updated_time: now,
        };
        self.put_detail(created.clone());
        Ok(created)
    }

    async fn update_job_detail(
        &mut self,
        id: i64,
        update: JobDetailUpdate,
    ) -> Result<JobDetail, DatabaseError> {
        self.refresh().await;
        let mut detail = self
            .working
            .details
            .get(&id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(format!("job_detail {}", id)))?;
        update.apply(&mut detail, now_timestamp());
        self.put_detail(detail.clone());
        Ok(detail)
    }

    async fn get_job_detail(&mut self, id: i64) -> Result<Option<JobDetail>, DatabaseError> {
        self.refresh().await;
        Ok(self.working.details.get(&id).cloned())
    }

    async fn get_job_detail_by_pool_and_name(
        &mut self,
        pool: &str,
        name: &str,
    ) -> Result<Option<JobDetail>, DatabaseError> {
        self.refresh().await;
        Ok(self
            .working
            .details
            .values()
            .find(|d| !d.deleted && d.pool == pool && d.name == name)
            .cloned())
    }

    async fn search_job_details(
        &mut self,
        filter: &JobDetailFilter,
        order: JobDetailOrder,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<JobDetail>, DatabaseError> {
        self.refresh().await;
        let mut matched: Vec<JobDetail> = self
            .working
            .details
            .values()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect();

        match order {
            JobDetailOrder::IdAsc => matched.sort_by_key(|d| d.id),
            JobDetailOrder::IdDesc => matched.sort_by_key(|d| std::cmp::Reverse(d.id)),
            JobDetailOrder::NextFireTimeAsc => matched.sort_by_key(|d| (d.next_fire_time, d.id)),
            JobDetailOrder::DeletedTimeAsc => matched.sort_by_key(|d| (d.deleted_time, d.id)),
        }

        Ok(matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete_job_detail(&mut self, id: i64) -> Result<(), DatabaseError> {
        self.refresh().await;
        self.working
            .details
            .remove(&id)
            .ok_or_else(|| DatabaseError::NotFound(format!("job_detail {}", id)))?;
        self.writes.details.insert(id, None);
        Ok(())
    }

    async fn find_due_waiting_job_details(
        &mut self,
        before: Timestamp,
    ) -> Result<Vec<JobDetail>, DatabaseError> {
        self.refresh().await;
        let mut due: Vec<JobDetail> = self
            .working
            .details
            .values()
            .filter(|d| !d.deleted && d.status == JobStatus::Waiting && d.next_fire_time <= before)
            .cloned()
            .collect();
        due.sort_by_key(|d| (d.priority, d.next_fire_time, d.id));
        Ok(due)
    }
}

#[async_trait]
impl JobFiredStore for MemoryTransaction {
    async fn create_job_fired(&mut self, fired: JobFiredInsert) -> Result<JobFired, DatabaseError> {
        let now = now_timestamp();
        let created = JobFired {
            id: self.next_fired_id().await,
            job_detail_id: fired.job_detail_id,
            fired_time: fired.fired_time,
            status: fired.status,
            created_time: now,
            updated_time: now,
        };
        self.put_fired(created.clone());
        Ok(created)
    }

    async fn update_job_fired(
        &mut self,
        id: i64,
        update: JobFiredUpdate,
    ) -> Result<JobFired, DatabaseError> {
        self.refresh().await;
        let mut fired = self
            .working
            .fired
            .get(&id)
            .cloned()
            .ok_or_else(|| DatabaseError::NotFound(format!("job_fired {}", id)))?;
        update.apply(&mut fired, now_timestamp());
        self.put_fired(fired.clone());
        Ok(fired)
    }

    async fn get_job_fired(&mut self, id: i64) -> Result<Option<JobFired>, DatabaseError> {
        self.refresh().await;
        Ok(self.working.fired.get(&id).cloned())
    }

    async fn get_one_job_fired_by_status(
        &mut self,
        status: FiredStatus,
    ) -> Result<Option<JobFired>, DatabaseError> {
        self.refresh().await;
        let details = &self.working.details;
        Ok(self
            .working
            .fired
            .values()
            .filter(|f| f.status == status)
            .min_by_key(|f| {
                let priority = details.get(&f.job_detail_id).map_or(0, |d| d.priority);
                (f.fired_time, priority, f.id)
            })
            .cloned())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let MemoryTransaction {
            access,
            working,
            writes,
        } = *self;
        match access {
            Access::Exclusive(mut guard) => *guard = working,
            // Last writer wins on rows written by several transactions
            Access::Shared(state) => writes.apply_to(&mut *state.lock().await),
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// Audit log kept in memory
#[derive(Debug, Default)]
pub struct MemoryJobLogSink {
    entries: Mutex<Vec<JobLog>>,
}

impl MemoryJobLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JobLog> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Status tags recorded for one job definition, in append order
    pub fn statuses_for(&self, job_detail_id: i64) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|log| log.job_detail_id == job_detail_id)
            .map(|log| log.status)
            .collect()
    }
}

#[async_trait]
impl JobLogSink for MemoryJobLogSink {
    async fn append(&self, log: JobLog) -> Result<(), DatabaseError> {
        self.entries
            .lock()
            .map_err(|_| DatabaseError::QueryFailed("log sink poisoned".to_string()))?
            .push(log);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MisfirePolicy;

    fn insert(name: &str, next_fire_time: Timestamp, priority: i32) -> JobDetailInsert {
        JobDetailInsert {
            name: name.to_string(),
            pool: "default".to_string(),
            source: "MAIN".to_string(),
            class: "log".to_string(),
            args: serde_json::Value::Null,
            priority,
            expression: None,
            next_fire_time,
            misfire_threshold: 300,
            misfire_policy: MisfirePolicy::Missed,
        }
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();

        let mut tx = store.begin().await.unwrap();
        tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.job_details().await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.job_details().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        }
        assert!(store.job_details().await.is_empty());
    }

    #[tokio::test]
    async fn test_due_waiting_excludes_deleted_and_acquired() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let low = tx.create_job_detail(insert("low", 50, 200)).await.unwrap();
        let high = tx.create_job_detail(insert("high", 60, 10)).await.unwrap();
        let deleted = tx.create_job_detail(insert("deleted", 10, 100)).await.unwrap();
        let acquired = tx.create_job_detail(insert("acquired", 10, 100)).await.unwrap();
        tx.create_job_detail(insert("later", 500, 100)).await.unwrap();
        tx.update_job_detail(deleted.id, JobDetailUpdate::soft_delete(1))
            .await
            .unwrap();
        tx.update_job_detail(acquired.id, JobDetailUpdate::status(JobStatus::Acquired))
            .await
            .unwrap();

        let due = tx.find_due_waiting_job_details(100).await.unwrap();
        let ids: Vec<i64> = due.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_and_name_unique_among_live_rows() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let first = tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        assert!(matches!(
            tx.create_job_detail(insert("a", 10, 100)).await,
            Err(DatabaseError::DuplicateKey(_))
        ));

        tx.update_job_detail(first.id, JobDetailUpdate::soft_delete(1))
            .await
            .unwrap();
        let second = tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        let found = tx
            .get_job_detail_by_pool_and_name("default", "a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, second.id);
    }

    #[tokio::test]
    async fn test_read_committed_transactions_interleave() {
        let store = MemoryStore::read_committed();
        assert_eq!(store.isolation(), Isolation::ReadCommitted);

        // A second open transaction does not wait for the first
        let mut writer = store.begin().await.unwrap();
        let mut reader = store.begin().await.unwrap();

        let created = writer.create_job_detail(insert("a", 10, 100)).await.unwrap();
        assert!(reader.get_job_detail(created.id).await.unwrap().is_none());
        assert!(reader.find_due_waiting_job_details(100).await.unwrap().is_empty());

        writer.commit().await.unwrap();
        let seen = reader.get_job_detail(created.id).await.unwrap().unwrap();
        assert_eq!(seen.name, "a");

        reader
            .update_job_detail(created.id, JobDetailUpdate::status(JobStatus::Acquired))
            .await
            .unwrap();
        assert_eq!(store.job_details().await[0].status, JobStatus::Waiting);
        reader.commit().await.unwrap();
        assert_eq!(store.job_details().await[0].status, JobStatus::Acquired);
    }

    #[tokio::test]
    async fn test_read_committed_allows_lost_updates() {
        let store = MemoryStore::read_committed();
        let mut tx = store.begin().await.unwrap();
        let detail = tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        tx.commit().await.unwrap();

        // Both see the definition waiting and both create a firing for it
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        for tx in [&mut first, &mut second] {
            let due = tx.find_due_waiting_job_details(100).await.unwrap();
            assert_eq!(due.len(), 1);
            tx.create_job_fired(JobFiredInsert {
                job_detail_id: detail.id,
                fired_time: 10,
                status: FiredStatus::Acquired,
            })
            .await
            .unwrap();
        }
        first.commit().await.unwrap();
        second.commit().await.unwrap();

        let fired = store.job_fireds_for(detail.id).await;
        assert_eq!(fired.len(), 2);
        assert_ne!(fired[0].id, fired[1].id);
    }

    #[tokio::test]
    async fn test_read_committed_rollback_discards_writes() {
        let store = MemoryStore::read_committed();
        let mut tx = store.begin().await.unwrap();
        let detail = tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.delete_job_detail(detail.id).await.unwrap();
        assert!(tx.get_job_detail(detail.id).await.unwrap().is_none());
        tx.rollback().await.unwrap();
        assert_eq!(store.job_details().await.len(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.delete_job_detail(detail.id).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.job_details().await.is_empty());
    }

    #[tokio::test]
    async fn test_oldest_fired_is_selected_first() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let detail = tx.create_job_detail(insert("a", 10, 100)).await.unwrap();
        let newer = tx
            .create_job_fired(JobFiredInsert {
                job_detail_id: detail.id,
                fired_time: 20,
                status: FiredStatus::Acquired,
            })
            .await
            .unwrap();
        let older = tx
            .create_job_fired(JobFiredInsert {
                job_detail_id: detail.id,
                fired_time: 10,
                status: FiredStatus::Acquired,
            })
            .await
            .unwrap();

        let first = tx
            .get_one_job_fired_by_status(FiredStatus::Acquired)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, older.id);

        tx.update_job_fired(older.id, JobFiredUpdate::status(FiredStatus::Success))
            .await
            .unwrap();
        let next = tx
            .get_one_job_fired_by_status(FiredStatus::Acquired)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, newer.id);
    }
}
