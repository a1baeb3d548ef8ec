// NATS JetStream publisher for scheduler events

use super::EventPublisher;
use crate::config::NatsConfig;
use crate::errors::QueueError;
use crate::models::JobEvent;
use async_nats::jetstream::context::PublishAckFuture;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, Stream};
use async_nats::jetstream::Context as JetStreamContext;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument};

/// NATS JetStream client
pub struct NatsClient {
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsClient {
    /// Connect to the NATS server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn new(config: NatsConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server");

        Ok(Self {
            jetstream: async_nats::jetstream::new(client),
            config,
        })
    }

    /// Create the event stream if it does not exist yet
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.>", self.config.subject_prefix)],
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(self.config.max_age_seconds),
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(stream_name = %self.config.stream_name, "Event stream initialized");
        Ok(stream)
    }

    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Publishes each event to `<subject_prefix>.<topic>`
pub struct NatsEventPublisher {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsEventPublisher {
    pub fn new(client: NatsClient) -> Self {
        Self {
            client,
            publish_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    fn subject(&self, event: &JobEvent) -> String {
        format!("{}.{}", self.client.config().subject_prefix, event.topic)
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    #[instrument(skip(self, event), fields(
        event_id = %event.id,
        topic = %event.topic,
        job_detail_id = event.job_detail_id
    ))]
    async fn publish(&self, event: &JobEvent) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(event)?;
        let subject = self.subject(event);

        // Nats-Msg-Id lets JetStream drop redeliveries of the same event
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", event.id.to_string().as_str());
        headers.insert("Job-Detail-Id", event.job_detail_id.to_string().as_str());

        let ack: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(subject.clone(), headers, payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish event: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, ack).await {
            Ok(Ok(_)) => {
                info!(subject = %subject, "Event published");
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}
