// Scheduling core: checker chain, job classes, worker pool and the service
// driving acquire, trigger, execute and reconcile

pub mod checker;
pub mod pool;
pub mod registry;
pub mod service;

pub use checker::{CheckerChain, JobChecker, MisfireChecker};
pub use pool::{JobPool, LocalJobPool};
pub use registry::{JobContext, JobFactory, JobRegistry, JobTask, LogJob, LOG_JOB_CLASS};
pub use service::{
    SchedulerComponents, SchedulerConfig, SchedulerService, ACQUIRE_JOBS_LOCK, TRIGGER_LOCK,
};
