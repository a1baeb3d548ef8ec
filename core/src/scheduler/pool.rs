// Worker pool that runs job tasks outside every scheduler lock

use super::registry::{JobContext, JobTask};
use crate::models::ExecutionResult;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument};

/// Runs a task to completion and reports its outcome
#[async_trait]
pub trait JobPool: Send + Sync {
    async fn run(&self, task: Box<dyn JobTask>, context: JobContext) -> ExecutionResult;
}

/// Runs tasks on the Tokio runtime, at most `concurrency` at a time.
///
/// A task that panics is reported as a failure instead of tearing down the
/// caller.
pub struct LocalJobPool {
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl LocalJobPool {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Permits not currently held by a running task
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for LocalJobPool {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl JobPool for LocalJobPool {
    #[instrument(skip(self, task, context), fields(
        job_detail_id = context.detail.id,
        job_fired_id = context.job_fired_id,
        class = %context.detail.class
    ))]
    async fn run(&self, task: Box<dyn JobTask>, context: JobContext) -> ExecutionResult {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => return ExecutionResult::failure(format!("Job pool closed: {}", e)),
        };

        debug!("Running job task");
        let handle = tokio::spawn(async move {
            let _permit = permit;
            task.execute(&context).await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!("Job task panicked");
                ExecutionResult::failure("job panicked")
            }
            Err(e) => ExecutionResult::failure(format!("Job task aborted: {}", e)),
        }
    }
}
