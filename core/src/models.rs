// Data model for job definitions, firings, audit logs and events
// All instants are epoch seconds (UTC).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Epoch seconds
pub type Timestamp = i64;

pub const DEFAULT_MISFIRE_THRESHOLD: i64 = 300;
pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_POOL: &str = "default";
pub const DEFAULT_SOURCE: &str = "MAIN";

/// Current wall-clock time in epoch seconds
pub fn now_timestamp() -> Timestamp {
    Utc::now().timestamp()
}

// ============================================================================
// Status Enums
// ============================================================================

/// Lifecycle status of a job definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Acquired,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Acquired => write!(f, "acquired"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "acquired" => Ok(JobStatus::Acquired),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Status of a single firing.
///
/// `Executing` is the checker's verdict for an on-time firing; it is persisted
/// while the job runs and replaced by `Success` or `Acquired` once the result
/// is reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiredStatus {
    Acquired,
    Executing,
    Success,
    Missed,
}

impl FiredStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredStatus::Acquired => "acquired",
            FiredStatus::Executing => "executing",
            FiredStatus::Success => "success",
            FiredStatus::Missed => "missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FiredStatus::Success)
    }
}

impl std::fmt::Display for FiredStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FiredStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acquired" => Ok(FiredStatus::Acquired),
            "executing" => Ok(FiredStatus::Executing),
            "success" => Ok(FiredStatus::Success),
            "missed" => Ok(FiredStatus::Missed),
            _ => Err(format!("Invalid fired status: {}", s)),
        }
    }
}

/// What to record when a firing falls outside its tolerance window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MisfirePolicy {
    #[default]
    Missed,
}

impl MisfirePolicy {
    /// Classification recorded on a firing that missed its window
    pub fn classification(&self) -> FiredStatus {
        match self {
            MisfirePolicy::Missed => FiredStatus::Missed,
        }
    }
}

impl std::fmt::Display for MisfirePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MisfirePolicy::Missed => write!(f, "missed"),
        }
    }
}

impl FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missed" => Ok(MisfirePolicy::Missed),
            _ => Err(format!("Invalid misfire policy: {}", s)),
        }
    }
}

// ============================================================================
// Job Definitions
// ============================================================================

/// A schedulable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub id: i64,
    pub name: String,
    pub pool: String,
    pub source: String,
    /// Registered job class used to build the runnable task
    pub class: String,
    pub args: serde_json::Value,
    /// Lower value runs first
    pub priority: i32,
    pub expression: Option<String>,
    pub next_fire_time: Timestamp,
    pub pre_fire_time: Option<Timestamp>,
    pub misfire_threshold: i64,
    pub misfire_policy: MisfirePolicy,
    pub status: JobStatus,
    pub deleted: bool,
    pub deleted_time: Option<Timestamp>,
    pub created_time: Timestamp,
    pub updated_time: Timestamp,
}

/// Scheduling request; unset fields receive defaults in `schedule()`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJobDetail {
    pub name: String,
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfire_threshold: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub misfire_policy: Option<MisfirePolicy>,
}

impl NewJobDetail {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            ..Default::default()
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_next_fire_time(mut self, next_fire_time: Timestamp) -> Self {
        self.next_fire_time = Some(next_fire_time);
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_misfire_threshold(mut self, seconds: i64) -> Self {
        self.misfire_threshold = Some(seconds);
        self
    }
}

/// Fully resolved definition ready to be inserted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetailInsert {
    pub name: String,
    pub pool: String,
    pub source: String,
    pub class: String,
    pub args: serde_json::Value,
    pub priority: i32,
    pub expression: Option<String>,
    pub next_fire_time: Timestamp,
    pub misfire_threshold: i64,
    pub misfire_policy: MisfirePolicy,
}

/// Partial update of a job definition; `None` leaves a column untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetailUpdate {
    pub status: Option<JobStatus>,
    pub next_fire_time: Option<Timestamp>,
    pub pre_fire_time: Option<Timestamp>,
    pub deleted: Option<bool>,
    pub deleted_time: Option<Timestamp>,
}

impl JobDetailUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn soft_delete(at: Timestamp) -> Self {
        Self {
            deleted: Some(true),
            deleted_time: Some(at),
            ..Default::default()
        }
    }

    pub(crate) fn apply(&self, detail: &mut JobDetail, now: Timestamp) {
        if let Some(status) = self.status {
            detail.status = status;
        }
        if let Some(next) = self.next_fire_time {
            detail.next_fire_time = next;
        }
        if let Some(pre) = self.pre_fire_time {
            detail.pre_fire_time = Some(pre);
        }
        if let Some(deleted) = self.deleted {
            detail.deleted = deleted;
        }
        if let Some(deleted_time) = self.deleted_time {
            detail.deleted_time = Some(deleted_time);
        }
        detail.updated_time = now;
    }
}

/// Search criteria for job definitions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDetailFilter {
    pub deleted: Option<bool>,
    /// Soft-deleted strictly before this instant
    pub deleted_before: Option<Timestamp>,
    pub pool: Option<String>,
    pub name: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobDetailFilter {
    pub fn matches(&self, detail: &JobDetail) -> bool {
        if let Some(deleted) = self.deleted {
            if detail.deleted != deleted {
                return false;
            }
        }
        if let Some(before) = self.deleted_before {
            match detail.deleted_time {
                Some(t) if t < before => {}
                _ => return false,
            }
        }
        if let Some(pool) = &self.pool {
            if &detail.pool != pool {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &detail.name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if detail.status != status {
                return false;
            }
        }
        true
    }
}

/// Ordering for job definition searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobDetailOrder {
    #[default]
    IdAsc,
    IdDesc,
    NextFireTimeAsc,
    DeletedTimeAsc,
}

// ============================================================================
// Firings
// ============================================================================

/// One concrete occurrence of a job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFired {
    pub id: i64,
    pub job_detail_id: i64,
    pub fired_time: Timestamp,
    pub status: FiredStatus,
    pub created_time: Timestamp,
    pub updated_time: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFiredInsert {
    pub job_detail_id: i64,
    pub fired_time: Timestamp,
    pub status: FiredStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFiredUpdate {
    pub status: Option<FiredStatus>,
    pub fired_time: Option<Timestamp>,
}

impl JobFiredUpdate {
    pub fn status(status: FiredStatus) -> Self {
        Self {
            status: Some(status),
            fired_time: None,
        }
    }

    pub(crate) fn apply(&self, fired: &mut JobFired, now: Timestamp) {
        if let Some(status) = self.status {
            fired.status = status;
        }
        if let Some(fired_time) = self.fired_time {
            fired.fired_time = fired_time;
        }
        fired.updated_time = now;
    }
}

/// A firing joined with the definition it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredJob {
    pub fired: JobFired,
    pub detail: JobDetail,
}

// ============================================================================
// Execution Results
// ============================================================================

/// Outcome signal returned by the job pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum ExecutionResult {
    Success,
    #[serde(rename = "error")]
    Failure { reason: String },
}

impl ExecutionResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ExecutionResult::Success => None,
            ExecutionResult::Failure { reason } => Some(reason),
        }
    }

    /// Tag written to the audit log
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionResult::Success => "success",
            ExecutionResult::Failure { .. } => "error",
        }
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionResult::Success => write!(f, "success"),
            ExecutionResult::Failure { reason } => write!(f, "error: {}", reason),
        }
    }
}

// ============================================================================
// Audit Log
// ============================================================================

/// Append-only snapshot of a job definition at a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLog {
    pub job_detail_id: i64,
    pub job_fired_id: Option<i64>,
    pub name: String,
    pub pool: String,
    pub source: String,
    pub class: String,
    pub args: serde_json::Value,
    pub priority: i32,
    /// Lifecycle tag or raw execution result
    pub status: String,
    /// Why an execution failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub hostname: String,
    pub created_time: Timestamp,
}

impl JobLog {
    pub fn new(
        detail: &JobDetail,
        job_fired_id: Option<i64>,
        status: impl Into<String>,
        hostname: &str,
    ) -> Self {
        Self {
            job_detail_id: detail.id,
            job_fired_id,
            name: detail.name.clone(),
            pool: detail.pool.clone(),
            source: detail.source.clone(),
            class: detail.class.clone(),
            args: detail.args.clone(),
            priority: detail.priority,
            status: status.into(),
            message: None,
            hostname: hostname.to_string(),
            created_time: now_timestamp(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    #[serde(rename = "job.created")]
    Created,
    #[serde(rename = "job.acquired")]
    Acquired,
    #[serde(rename = "job.executing")]
    Executing,
    #[serde(rename = "job.executed")]
    Executed,
}

impl EventTopic {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventTopic::Created => "job.created",
            EventTopic::Acquired => "job.acquired",
            EventTopic::Executing => "job.executing",
            EventTopic::Executed => "job.executed",
        }
    }
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound notification emitted for a state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: Uuid,
    pub topic: EventTopic,
    pub job_detail_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_fired_id: Option<i64>,
    pub job_name: String,
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fired_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(topic: EventTopic, detail: &JobDetail, fired: Option<&JobFired>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            job_detail_id: detail.id,
            job_fired_id: fired.map(|f| f.id),
            job_name: detail.name.clone(),
            pool: detail.pool.clone(),
            fired_time: fired.map(|f| f.fired_time),
            result: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_result(mut self, result: ExecutionResult) -> Self {
        self.result = Some(result);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_detail() -> JobDetail {
        JobDetail {
            id: 7,
            name: "report".to_string(),
            pool: DEFAULT_POOL.to_string(),
            source: DEFAULT_SOURCE.to_string(),
            class: "log".to_string(),
            args: serde_json::json!({"k": "v"}),
            priority: DEFAULT_PRIORITY,
            expression: None,
            next_fire_time: 1_000,
            pre_fire_time: None,
            misfire_threshold: DEFAULT_MISFIRE_THRESHOLD,
            misfire_policy: MisfirePolicy::Missed,
            status: JobStatus::Waiting,
            deleted: false,
            deleted_time: None,
            created_time: 0,
            updated_time: 0,
        }
    }

    #[test]
    fn test_status_string_forms() {
        for status in [
            FiredStatus::Acquired,
            FiredStatus::Executing,
            FiredStatus::Success,
            FiredStatus::Missed,
        ] {
            assert_eq!(status.to_string().parse::<FiredStatus>(), Ok(status));
        }
        assert_eq!("waiting".parse::<JobStatus>(), Ok(JobStatus::Waiting));
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_unknown_misfire_policy_is_rejected() {
        assert_eq!("missed".parse::<MisfirePolicy>(), Ok(MisfirePolicy::Missed));
        assert!("fire_now".parse::<MisfirePolicy>().is_err());
    }

    #[test]
    fn test_update_leaves_unset_columns() {
        let mut detail = sample_detail();
        JobDetailUpdate::status(JobStatus::Acquired).apply(&mut detail, 50);
        assert_eq!(detail.status, JobStatus::Acquired);
        assert_eq!(detail.next_fire_time, 1_000);
        assert_eq!(detail.pre_fire_time, None);
        assert_eq!(detail.updated_time, 50);
    }

    #[test]
    fn test_filter_deleted_before_requires_deleted_time() {
        let mut detail = sample_detail();
        let filter = JobDetailFilter {
            deleted: Some(true),
            deleted_before: Some(100),
            ..Default::default()
        };
        assert!(!filter.matches(&detail));

        JobDetailUpdate::soft_delete(99).apply(&mut detail, 99);
        assert!(filter.matches(&detail));

        detail.deleted_time = Some(100);
        assert!(!filter.matches(&detail));
    }

    #[test]
    fn test_execution_result_tags() {
        assert_eq!(ExecutionResult::Success.as_str(), "success");
        assert_eq!(ExecutionResult::failure("boom").as_str(), "error");
        let json = serde_json::to_value(ExecutionResult::failure("boom")).unwrap();
        assert_eq!(json["result"], "error");
        assert_eq!(json["reason"], "boom");
        assert_eq!(ExecutionResult::failure("boom").reason(), Some("boom"));
        assert_eq!(ExecutionResult::Success.reason(), None);
    }

    #[test]
    fn test_job_log_snapshot() {
        let detail = sample_detail();
        let log = JobLog::new(&detail, Some(3), "acquired", "node-a");
        assert_eq!(log.job_detail_id, 7);
        assert_eq!(log.job_fired_id, Some(3));
        assert_eq!(log.status, "acquired");
        assert_eq!(log.hostname, "node-a");
        assert_eq!(log.args, detail.args);
        assert!(log.message.is_none());

        let failed = JobLog::new(&detail, Some(3), "error", "node-a").with_message("disk full");
        assert_eq!(failed.message.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_event_topic_serializes_dotted() {
        let event = JobEvent::new(EventTopic::Executed, &sample_detail(), None)
            .with_result(ExecutionResult::Success);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["topic"], "job.executed");
        assert_eq!(json["result"]["result"], "success");
    }
}
