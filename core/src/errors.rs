// Error handling framework
// One thiserror enum per concern; SchedulerError is what callers of the service see.

use thiserror::Error;

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("No next fire time available for expression '{0}'")]
    NoNextFireTime(String),
}

/// Validation errors for scheduling requests
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Either a cron expression or a next fire time is required")]
    MissingSchedule,
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// Distributed lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock already held for resource: {0}")]
    AlreadyHeld(String),

    #[error("Lock no longer owned for resource: {0}")]
    NotOwned(String),

    #[error("Lock backend error: {0}")]
    Backend(String),

    #[error("Lock backend connection failed: {0}")]
    ConnectionFailed(String),
}

/// Event bus errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Message serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Queue operation timeout: {0}")]
    Timeout(String),
}

/// Failures raised while running a lock-guarded phase
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Service-level scheduler errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid argument: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Scheduler phase '{phase}' failed: {source}")]
    Coordination {
        phase: &'static str,
        #[source]
        source: PhaseError,
    },
}

impl SchedulerError {
    pub fn coordination(phase: &'static str, source: impl Into<PhaseError>) -> Self {
        SchedulerError::Coordination {
            phase,
            source: source.into(),
        }
    }

    /// Whether the failed call can simply be repeated on the next tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Coordination { .. } | SchedulerError::Database(_)
        )
    }
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    match code.as_ref() {
                        "23505" => DatabaseError::DuplicateKey(db_err.message().to_string()),
                        "23503" => DatabaseError::ForeignKeyViolation(db_err.message().to_string()),
                        _ => DatabaseError::QueryFailed(db_err.message().to_string()),
                    }
                } else {
                    DatabaseError::QueryFailed(db_err.message().to_string())
                }
            }
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::SerializationFailed(err.to_string())
    }
}
