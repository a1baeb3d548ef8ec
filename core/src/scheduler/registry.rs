// Job classes: runnable tasks resolved from the class name stored on a definition

use crate::models::{ExecutionResult, FiredJob, JobDetail, Timestamp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Built-in class that only logs its arguments
pub const LOG_JOB_CLASS: &str = "log";

/// Everything a task gets to see about the firing it runs for
#[derive(Debug, Clone)]
pub struct JobContext {
    pub detail: JobDetail,
    pub job_fired_id: i64,
    pub fired_time: Timestamp,
    pub args: serde_json::Value,
}

impl JobContext {
    pub fn new(job: &FiredJob) -> Self {
        Self {
            detail: job.detail.clone(),
            job_fired_id: job.fired.id,
            fired_time: job.fired.fired_time,
            args: job.detail.args.clone(),
        }
    }
}

/// A runnable unit of job code
#[async_trait]
pub trait JobTask: Send + Sync {
    /// Run the job. Failures are reported through the result, never raised.
    async fn execute(&self, context: &JobContext) -> ExecutionResult;
}

pub type JobFactory = Arc<dyn Fn(&JobDetail) -> Box<dyn JobTask> + Send + Sync>;

/// Maps class names to task factories; populated once at process start
#[derive(Clone, Default)]
pub struct JobRegistry {
    factories: HashMap<String, JobFactory>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in job classes
    pub fn with_builtin_jobs() -> Self {
        let mut registry = Self::new();
        registry.register(LOG_JOB_CLASS, |_| Box::new(LogJob));
        registry
    }

    /// Register a factory, replacing any previous one for the same class
    pub fn register<F>(&mut self, class: impl Into<String>, factory: F)
    where
        F: Fn(&JobDetail) -> Box<dyn JobTask> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Arc::new(factory));
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.factories.keys().cloned().collect();
        classes.sort();
        classes
    }

    /// Build the task for a definition, `None` if its class is unknown
    pub fn resolve(&self, detail: &JobDetail) -> Option<Box<dyn JobTask>> {
        self.factories
            .get(&detail.class)
            .map(|factory| factory(detail))
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.classes())
            .finish()
    }
}

/// No-op job that writes its arguments to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogJob;

#[async_trait]
impl JobTask for LogJob {
    async fn execute(&self, context: &JobContext) -> ExecutionResult {
        info!(
            job_detail_id = context.detail.id,
            job_fired_id = context.job_fired_id,
            job_name = %context.detail.name,
            args = %context.args,
            "Log job executed"
        );
        ExecutionResult::Success
    }
}
