// Event bus for scheduler state transitions
//
// The scheduler only enqueues events; a dispatcher task drains the queue and
// talks to the broker, so publishing latency never extends a critical section.

pub mod nats;

pub use nats::{NatsClient, NatsEventPublisher};

use crate::errors::QueueError;
use crate::models::JobEvent;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Delivers events to the outside world
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &JobEvent) -> Result<(), QueueError>;
}

/// Producer side of the outbound event queue
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventBus {
    /// Bus plus the receiving end, for callers that drain events themselves
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// Bus that discards every event
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, event: JobEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(e) = sender.send(event) {
            warn!(topic = %e.0.topic, "Event dispatcher stopped, dropping event");
        }
    }
}

/// Consumer side: publishes queued events with bounded retry
pub struct EventDispatcher {
    receiver: mpsc::UnboundedReceiver<JobEvent>,
    publisher: Arc<dyn EventPublisher>,
    max_retries: u32,
    base_delay: Duration,
}

impl EventDispatcher {
    pub fn new(receiver: mpsc::UnboundedReceiver<JobEvent>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            receiver,
            publisher,
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    /// Start a dispatcher task and return the bus feeding it
    pub fn spawn(publisher: Arc<dyn EventPublisher>) -> (EventBus, JoinHandle<()>) {
        let (bus, receiver) = EventBus::channel();
        let handle = tokio::spawn(EventDispatcher::new(receiver, publisher).run());
        (bus, handle)
    }

    /// Runs until every `EventBus` clone has been dropped and the queue is empty
    pub async fn run(mut self) {
        info!("Event dispatcher started");
        while let Some(event) = self.receiver.recv().await {
            self.publish_with_retry(&event).await;
        }
        info!("Event dispatcher stopped");
    }

    async fn publish_with_retry(&self, event: &JobEvent) {
        let mut attempt = 0;

        loop {
            match self.publisher.publish(event).await {
                Ok(()) => {
                    debug!(event_id = %event.id, topic = %event.topic, "Event published");
                    return;
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.base_delay * 2_u32.pow(attempt - 1);
                    warn!(
                        event_id = %event.id,
                        topic = %event.topic,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        topic = %event.topic,
                        error = %e,
                        "Giving up on event"
                    );
                    return;
                }
            }
        }
    }
}

/// Publisher that only writes events to the log
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, event: &JobEvent) -> Result<(), QueueError> {
        info!(
            topic = %event.topic,
            job_detail_id = event.job_detail_id,
            job_fired_id = ?event.job_fired_id,
            job_name = %event.job_name,
            "Job event"
        );
        Ok(())
    }
}
